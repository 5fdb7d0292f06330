use std::path::PathBuf;
use thiserror::Error;
use watchsync_config::ConfigError;
use watchsync_sources::SourceError;

/// Errors that stop a run before or during indexing.
///
/// Per-record and per-user problems never surface here; they are
/// collected in the run report instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot use the {role} server: {source}")]
    Connectivity {
        role: String,
        #[source]
        source: SourceError,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid snapshot {}: {message}", .path.display())]
    SnapshotFormat { path: PathBuf, message: String },
    #[error("snapshot I/O on {}: {source}", .path.display())]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn connectivity(role: impl Into<String>, source: SourceError) -> Self {
        SyncError::Connectivity {
            role: role.into(),
            source,
        }
    }
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        SyncError::Configuration(e.to_string())
    }
}
