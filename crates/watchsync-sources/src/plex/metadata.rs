//! Old-agent to new-agent GUID conversion through the Plex metadata service.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use watchsync_models::{Identifier, MediaKind, Namespace};

use super::api::{str_field, u64_field, PlexHttpClient, TYPE_MOVIE, TYPE_SHOW};
use crate::error::SourceError;
use crate::traits::{legacy_episode_ref, GuidConverter};

/// Looks up `plex://` GUIDs for items that only carry old-agent references.
///
/// Episodes are found by walking the series and season trees, so those are
/// kept for the lifetime of the converter; one series usually has many
/// episodes to convert.
pub struct PlexGuidConverter {
    api: PlexHttpClient,
    shows: RwLock<HashMap<String, Option<Value>>>,
    seasons: RwLock<HashMap<String, Option<Value>>>,
}

impl PlexGuidConverter {
    pub fn new(metadata_url: &str, token: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            api: PlexHttpClient::new(metadata_url, token, timeout, 1)?,
            shows: RwLock::new(HashMap::new()),
            seasons: RwLock::new(HashMap::new()),
        })
    }

    async fn show(&self, tvdb_id: &str) -> Result<Option<Value>, SourceError> {
        if let Some(cached) = self.shows.read().await.get(tvdb_id) {
            return Ok(cached.clone());
        }
        let token = self.api.owner_token();
        let guid = format!("com.plexapp.agents.thetvdb://{}?lang=en", tvdb_id);
        let show = match self.api.match_guid(token, TYPE_SHOW, &guid).await? {
            Some(found) => match str_field(&found, "ratingKey") {
                Some(key) => Some(self.api.get_metadata_with_children(token, &key).await?),
                None => None,
            },
            None => None,
        };
        self.shows.write().await.insert(tvdb_id.to_string(), show.clone());
        Ok(show)
    }

    async fn season(&self, tvdb_id: &str, season: &str) -> Result<Option<Value>, SourceError> {
        let key = format!("{}/{}", tvdb_id, season);
        if let Some(cached) = self.seasons.read().await.get(&key) {
            return Ok(cached.clone());
        }
        let found = match self.show(tvdb_id).await? {
            Some(show) => match child_with_index(&show, season).and_then(|s| str_field(s, "ratingKey")) {
                Some(rating_key) => Some(
                    self.api
                        .get_metadata_with_children(self.api.owner_token(), &rating_key)
                        .await?,
                ),
                None => None,
            },
            None => None,
        };
        self.seasons.write().await.insert(key, found.clone());
        Ok(found)
    }
}

#[async_trait]
impl GuidConverter for PlexGuidConverter {
    async fn convert(&self, kind: MediaKind, identifier: &Identifier) -> Result<Option<Identifier>, SourceError> {
        let guid = match (kind, identifier.namespace) {
            (MediaKind::Movie, Namespace::Tmdb) => {
                let legacy = format!("com.plexapp.agents.themoviedb://{}?lang=en", identifier.value);
                self.api
                    .match_guid(self.api.owner_token(), TYPE_MOVIE, &legacy)
                    .await?
                    .and_then(|movie| str_field(&movie, "guid"))
            }
            (MediaKind::Show, Namespace::Tvdb) => self
                .show(&identifier.value)
                .await?
                .and_then(|show| str_field(&show, "guid")),
            (MediaKind::Episode, Namespace::Legacy) => match legacy_episode_ref(&identifier.value) {
                Some((series, season, episode)) => self
                    .season(series, season)
                    .await?
                    .as_ref()
                    .and_then(|s| child_with_index(s, episode))
                    .and_then(|e| str_field(e, "guid")),
                None => None,
            },
            _ => None,
        };

        let converted = guid.as_deref().and_then(Identifier::parse_guid);
        debug!(
            "Converted {} {} to {}",
            kind,
            identifier,
            converted.as_ref().map_or("nothing".to_string(), |c| c.to_string())
        );
        Ok(converted)
    }
}

/// Child (season or episode) whose `index` equals `index`, compared as numbers.
fn child_with_index<'a>(parent: &'a Value, index: &str) -> Option<&'a Value> {
    let wanted: u64 = index.parse().ok()?;
    parent
        .get("Children")?
        .get("Metadata")?
        .as_array()?
        .iter()
        .find(|child| u64_field(child, "index") == Some(wanted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn converter() -> PlexGuidConverter {
        PlexGuidConverter::new("https://metadata.provider.plex.tv", "abc".to_string(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_child_with_index() {
        let season = json!({
            "Children": {"Metadata": [
                {"index": 1, "guid": "plex://episode/a"},
                {"index": "2", "guid": "plex://episode/b"}
            ]}
        });
        let second = child_with_index(&season, "02").unwrap();
        assert_eq!(str_field(second, "guid").as_deref(), Some("plex://episode/b"));
        assert!(child_with_index(&season, "3").is_none());
        assert!(child_with_index(&json!({}), "1").is_none());
    }

    #[test]
    fn test_accepts_old_agent_references_only() {
        let converter = converter();
        let legacy_episode = Identifier::new(Namespace::Legacy, "thetvdb://81189/1/2");
        assert!(converter.accepts(MediaKind::Episode, &legacy_episode));
        assert!(converter.accepts(MediaKind::Movie, &Identifier::new(Namespace::Tmdb, "278")));
        assert!(converter.accepts(MediaKind::Show, &Identifier::new(Namespace::Tvdb, "81189")));

        assert!(!converter.accepts(MediaKind::Movie, &Identifier::new(Namespace::Imdb, "tt1")));
        assert!(!converter.accepts(MediaKind::Show, &Identifier::new(Namespace::Tmdb, "278")));
        assert!(!converter.accepts(
            MediaKind::Episode,
            &Identifier::new(Namespace::Legacy, "thetvdb://81189/1")
        ));
    }

    #[tokio::test]
    async fn test_cached_miss_needs_no_request() {
        let converter = converter();
        converter.shows.write().await.insert("81189".to_string(), None);
        let show = Identifier::new(Namespace::Tvdb, "81189");
        assert_eq!(converter.convert(MediaKind::Show, &show).await.unwrap(), None);

        let episode = Identifier::new(Namespace::Legacy, "thetvdb://81189/1/2");
        assert_eq!(converter.convert(MediaKind::Episode, &episode).await.unwrap(), None);
    }
}
