pub mod config;
pub mod credentials;
pub mod paths;

pub use config::{CacheSettings, Config, ConfigError, LoggingSettings, Role, ServerConfig, SyncSettings, MAX_WORKERS};
pub use credentials::CredentialStore;
pub use paths::{container_base_path, PathManager};
