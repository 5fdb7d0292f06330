use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use watchsync_models::AgentMode;

use crate::credentials::CredentialStore;

pub const MAX_WORKERS: usize = 64;

/// Which end of a transfer a server plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Destination,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Destination => "destination",
        }
    }

    /// Key under which the role's token lives in `credentials.toml`.
    pub fn token_key(&self) -> &'static str {
        match self {
            Role::Source => "source_token",
            Role::Destination => "destination_token",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("[{0}] url is not set")]
    MissingUrl(Role),
    #[error("[{0}] url '{1}' must start with http:// or https://")]
    InvalidUrl(Role, String),
    #[error("no token for {0}: set [{0}] token or '{1}' in credentials.toml")]
    MissingToken(Role, &'static str),
    #[error("sync.workers must be between 1 and 64, got {0}")]
    InvalidWorkers(usize),
    #[error("sync.snapshot must not be empty")]
    EmptySnapshotPath,
    #[error("sync.metadata_url '{0}' must start with http:// or https://")]
    InvalidMetadataUrl(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: ServerConfig,
    #[serde(default)]
    pub destination: ServerConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Case-insensitive user names to process; empty means every user.
    #[serde(default)]
    pub users: Vec<String>,
    /// Section keys or titles to process; empty means every supported section.
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default)]
    pub agent_mode: AgentMode,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_snapshot")]
    pub snapshot: PathBuf,
    /// Export every visible item, not only those with activity.
    #[serde(default)]
    pub include_unwatched: bool,
    /// Look up new-agent GUIDs for items that only have old-agent ones.
    #[serde(default)]
    pub convert_guids: bool,
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to the data directory's `cache` folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// How long a cached section listing is reused; 0 disables listing reuse.
    #[serde(default = "default_listing_ttl_hours")]
    pub listing_ttl_hours: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_log_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_page_size() -> u32 {
    200
}

fn default_workers() -> usize {
    4
}

fn default_snapshot() -> PathBuf {
    PathBuf::from("watched-history.json")
}

fn default_metadata_url() -> String {
    "https://metadata.provider.plex.tv".to_string()
}

fn default_listing_ttl_hours() -> u64 {
    24
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            sections: Vec::new(),
            agent_mode: AgentMode::default(),
            workers: default_workers(),
            snapshot: default_snapshot(),
            include_unwatched: false,
            convert_guids: false,
            metadata_url: default_metadata_url(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            listing_ttl_hours: default_listing_ttl_hours(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Commented starting point written by `watchsync config init`.
    pub fn template() -> &'static str {
        include_str!("template.toml")
    }

    pub fn server(&self, role: Role) -> &ServerConfig {
        match role {
            Role::Source => &self.source,
            Role::Destination => &self.destination,
        }
    }

    pub fn log_file(&self, role: Role) -> Option<&Path> {
        match role {
            Role::Source => self.logging.export_log_file.as_deref(),
            Role::Destination => self.logging.import_log_file.as_deref(),
        }
    }

    /// Settings shared by every command.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.workers == 0 || self.sync.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkers(self.sync.workers));
        }
        if self.sync.snapshot.as_os_str().is_empty() {
            return Err(ConfigError::EmptySnapshotPath);
        }
        let metadata_url = self.sync.metadata_url.trim();
        if self.sync.convert_guids && !(metadata_url.starts_with("http://") || metadata_url.starts_with("https://")) {
            return Err(ConfigError::InvalidMetadataUrl(metadata_url.to_string()));
        }
        Ok(())
    }

    /// Shared settings plus the server block `role` needs.
    pub fn validate_for(&self, role: Role, credentials: &CredentialStore) -> Result<(), ConfigError> {
        self.validate()?;
        let server = self.server(role);
        let url = server.url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingUrl(role));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(role, url.to_string()));
        }
        self.resolve_token(role, credentials)?;
        Ok(())
    }

    /// Token from the config file, falling back to the credential store.
    pub fn resolve_token(&self, role: Role, credentials: &CredentialStore) -> Result<String, ConfigError> {
        self.server(role)
            .token
            .as_ref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| credentials.get_token(role))
            .map(|t| t.trim().to_string())
            .ok_or(ConfigError::MissingToken(role, role.token_key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_config() -> Config {
        let mut config = Config::default();
        config.source.url = "http://old:32400".to_string();
        config.source.token = Some("old-token".to_string());
        config.destination.url = "https://new:32400".to_string();
        config.sync.users = vec!["Alice".to_string()];
        config.sync.agent_mode = AgentMode::Mixed;
        config
    }

    fn empty_credentials() -> CredentialStore {
        CredentialStore::new(PathBuf::from("/nonexistent/credentials.toml"))
    }

    #[test]
    fn test_config_load_and_save() {
        let file = NamedTempFile::new().unwrap();
        let config = create_config();
        config.save_to_file(file.path()).unwrap();

        let loaded = Config::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.source.url, "http://old:32400");
        assert_eq!(loaded.sync.users, vec!["Alice".to_string()]);
        assert_eq!(loaded.sync.agent_mode, AgentMode::Mixed);
        assert_eq!(loaded.sync.workers, 4);
        assert!(loaded.cache.enabled);
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config: Config = toml::from_str("[source]\nurl = \"http://a\"\n").unwrap();
        assert_eq!(config.sync.workers, 4);
        assert_eq!(config.cache.listing_ttl_hours, 24);
        assert_eq!(config.source.page_size, 200);
        assert_eq!(config.sync.agent_mode, AgentMode::Uniform);
        assert!(!config.sync.include_unwatched);
        assert!(!config.sync.convert_guids);
        assert_eq!(config.sync.metadata_url, "https://metadata.provider.plex.tv");
    }

    #[test]
    fn test_conversion_needs_a_metadata_url() {
        let mut config = Config::default();
        config.sync.metadata_url = String::new();
        assert!(config.validate().is_ok());
        config.sync.convert_guids = true;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMetadataUrl(String::new())));
    }

    #[test]
    fn test_template_parses() {
        let config: Config = toml::from_str(Config::template()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate() {
        let mut config = create_config();
        assert!(config.validate_for(Role::Source, &empty_credentials()).is_ok());
        assert_eq!(
            config.validate_for(Role::Destination, &empty_credentials()),
            Err(ConfigError::MissingToken(Role::Destination, "destination_token"))
        );

        config.sync.workers = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidWorkers(0)));

        config.sync.workers = 2;
        config.source.url = "old:32400".to_string();
        assert!(matches!(
            config.validate_for(Role::Source, &empty_credentials()),
            Err(ConfigError::InvalidUrl(Role::Source, _))
        ));

        config.source.url = String::new();
        assert_eq!(
            config.validate_for(Role::Source, &empty_credentials()),
            Err(ConfigError::MissingUrl(Role::Source))
        );
    }

    #[test]
    fn test_token_falls_back_to_credentials() {
        let config = create_config();
        let mut credentials = empty_credentials();
        credentials.set_token(Role::Destination, "from-store".to_string());
        assert_eq!(config.resolve_token(Role::Destination, &credentials).unwrap(), "from-store");
        assert_eq!(config.resolve_token(Role::Source, &credentials).unwrap(), "old-token");
    }
}
