use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const LEGACY_AGENT_PREFIX: &str = "com.plexapp.agents.";

/// Metadata agent namespace an identifier belongs to.
///
/// Declaration order is match priority: earlier variants win when an item
/// carries several identifiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Plex,
    Imdb,
    Tmdb,
    Tvdb,
    Audnexus,
    Legacy,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Plex => "plex",
            Namespace::Imdb => "imdb",
            Namespace::Tmdb => "tmdb",
            Namespace::Tvdb => "tvdb",
            Namespace::Audnexus => "audnexus",
            Namespace::Legacy => "legacy",
        }
    }

    /// Lower is preferred.
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// Portable namespaces are exposed identically by old and new agents.
    pub fn is_portable(&self) -> bool {
        !matches!(self, Namespace::Plex | Namespace::Legacy)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "plex" => Ok(Namespace::Plex),
            "imdb" => Ok(Namespace::Imdb),
            "tmdb" | "themoviedb" => Ok(Namespace::Tmdb),
            "tvdb" | "thetvdb" => Ok(Namespace::Tvdb),
            "audnexus" => Ok(Namespace::Audnexus),
            "legacy" => Ok(Namespace::Legacy),
            other => Err(format!("Unknown identifier namespace: {}", other)),
        }
    }
}

/// Agent-qualified external identifier, rendered as `namespace:value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier {
    pub namespace: Namespace,
    pub value: String,
}

impl Identifier {
    pub fn new(namespace: Namespace, value: impl Into<String>) -> Self {
        Self {
            namespace,
            value: value.into(),
        }
    }

    /// Parse a media-server GUID such as `imdb://tt0111161`,
    /// `plex://movie/5d776b59ad5437001f79c6f8` or
    /// `com.plexapp.agents.thetvdb://81189/1/2?lang=en`.
    ///
    /// Also accepts the `namespace:value` form written to snapshots.
    /// Returns `None` for local, empty or malformed GUIDs.
    pub fn parse_guid(guid: &str) -> Option<Self> {
        let guid = guid.trim();
        if guid.is_empty() {
            return None;
        }

        let Some((scheme, rest)) = guid.split_once("://") else {
            return guid.parse().ok();
        };

        let value = rest.split('?').next().unwrap_or("").trim_end_matches('/');
        if value.is_empty() {
            return None;
        }

        match scheme.to_lowercase().as_str() {
            "local" | "none" | "file" => None,
            "plex" => Some(Self::new(Namespace::Plex, value)),
            "imdb" => Self::imdb(value),
            "tmdb" => Self::numeric(Namespace::Tmdb, value),
            "tvdb" => Self::numeric(Namespace::Tvdb, value),
            "audnexus" => Some(Self::new(Namespace::Audnexus, value)),
            other => {
                let agent = other.strip_prefix(LEGACY_AGENT_PREFIX).unwrap_or(other);
                // Hierarchical references (show/season/episode) only mean something to the old agent
                if value.contains('/') {
                    return Some(Self::new(Namespace::Legacy, format!("{}://{}", agent, value)));
                }
                match agent {
                    "imdb" => Self::imdb(value),
                    "themoviedb" | "tmdb" => Self::numeric(Namespace::Tmdb, value),
                    "thetvdb" | "tvdb" => Self::numeric(Namespace::Tvdb, value),
                    "audnexus" => Some(Self::new(Namespace::Audnexus, value)),
                    _ => Some(Self::new(Namespace::Legacy, format!("{}://{}", agent, value))),
                }
            }
        }
    }

    fn imdb(value: &str) -> Option<Self> {
        let valid = value.len() > 2
            && value.starts_with("tt")
            && value[2..].chars().all(|c| c.is_ascii_digit());
        valid.then(|| Self::new(Namespace::Imdb, value))
    }

    fn numeric(namespace: Namespace, value: &str) -> Option<Self> {
        value
            .chars()
            .all(|c| c.is_ascii_digit())
            .then(|| Self::new(namespace, value))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.value)
    }
}

impl FromStr for Identifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, value) = s
            .split_once(':')
            .ok_or_else(|| format!("Identifier '{}' is not in namespace:value form", s))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("Identifier '{}' has an empty value", s));
        }
        Ok(Self::new(namespace.parse()?, value))
    }
}
