//! Builds media servers from configuration.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use watchsync_config::{Config, CredentialStore, Role};

use crate::plex::{PlexGuidConverter, PlexServer};
use crate::{GuidConverter, MediaServer};

/// Server for one role of a transfer, after validating that role's settings.
pub fn create_server(role: Role, config: &Config, credentials: &CredentialStore) -> Result<Arc<dyn MediaServer>> {
    config.validate_for(role, credentials)?;
    let server_config = config.server(role);
    let token = config.resolve_token(role, credentials)?;

    let server = PlexServer::new(
        role.as_str(),
        server_config.url.trim(),
        token,
        Duration::from_secs(server_config.timeout_secs.max(1)),
        server_config.page_size,
    )?
    .with_audiobook_hints(config.sync.sections.clone());

    Ok(Arc::new(server))
}

/// GUID converter when `sync.convert_guids` is on. Uses the source token,
/// or the destination one for an import-only setup.
pub fn create_converter(config: &Config, credentials: &CredentialStore) -> Result<Option<Arc<dyn GuidConverter>>> {
    if !config.sync.convert_guids {
        return Ok(None);
    }
    let token = config
        .resolve_token(Role::Source, credentials)
        .or_else(|_| config.resolve_token(Role::Destination, credentials))?;
    let timeout = Duration::from_secs(config.source.timeout_secs.max(1));
    let converter = PlexGuidConverter::new(config.sync.metadata_url.trim(), token, timeout)?;
    Ok(Some(Arc::new(converter)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_create_server_validates_role() {
        let credentials = CredentialStore::new(PathBuf::from("/nonexistent/credentials.toml"));
        let mut config = Config::default();
        config.source.url = "http://localhost:32400".to_string();
        config.source.token = Some("abc".to_string());

        let server = create_server(Role::Source, &config, &credentials).unwrap();
        assert_eq!(server.label(), "source");

        let err = create_server(Role::Destination, &config, &credentials).err().unwrap();
        assert!(err.to_string().contains("destination"));
    }

    #[test]
    fn test_converter_only_when_enabled() {
        let credentials = CredentialStore::new(PathBuf::from("/nonexistent/credentials.toml"));
        let mut config = Config::default();
        assert!(create_converter(&config, &credentials).unwrap().is_none());

        config.sync.convert_guids = true;
        assert!(create_converter(&config, &credentials).is_err());

        config.destination.token = Some("abc".to_string());
        assert!(create_converter(&config, &credentials).unwrap().is_some());
    }
}
