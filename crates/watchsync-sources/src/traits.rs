use async_trait::async_trait;
use std::collections::HashMap;
use watchsync_models::{Identifier, MediaItem, MediaKind, Namespace, Section, ServerUser, WatchState};

use crate::error::SourceError;

/// Identity of a connected server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Stable across runs and URL changes; used to scope cache entries.
    pub identity: String,
    pub name: String,
    pub version: Option<String>,
}

/// Everything the sync engine needs from a media server.
///
/// Reads and writes of watch state are always on behalf of one user.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Label used in logs, e.g. "source" or "destination".
    fn label(&self) -> &str;

    async fn connect(&self) -> Result<ServerInfo, SourceError>;

    /// Sections of a supported kind. Unsupported sections are not returned.
    async fn list_sections(&self) -> Result<Vec<Section>, SourceError>;

    async fn list_items(&self, section: &Section) -> Result<Vec<MediaItem>, SourceError>;

    /// The owner first, then every shared user.
    async fn list_users(&self) -> Result<Vec<ServerUser>, SourceError>;

    async fn get_watch_state(&self, user: &ServerUser, item: &MediaItem) -> Result<WatchState, SourceError>;

    /// Watch state of many items in one section, keyed by rating key.
    ///
    /// Servers that can list a whole section per user should override this.
    async fn list_watch_states(
        &self,
        user: &ServerUser,
        _section: &Section,
        items: &[MediaItem],
    ) -> Result<HashMap<String, WatchState>, SourceError> {
        let mut states = HashMap::with_capacity(items.len());
        for item in items {
            let state = self.get_watch_state(user, item).await?;
            states.insert(item.rating_key.clone(), state);
        }
        Ok(states)
    }

    /// Record one more complete play.
    async fn mark_watched(&self, user: &ServerUser, item: &MediaItem) -> Result<(), SourceError>;

    /// Clear the watched flag, play count and resume position.
    async fn mark_unwatched(&self, user: &ServerUser, item: &MediaItem) -> Result<(), SourceError>;

    async fn set_rating(&self, user: &ServerUser, item: &MediaItem, rating: f32) -> Result<(), SourceError>;

    async fn update_progress(&self, user: &ServerUser, item: &MediaItem, offset_ms: u64) -> Result<(), SourceError>;
}

/// Translates an old-agent identifier into the current agent's identifier for the same item.
#[async_trait]
pub trait GuidConverter: Send + Sync {
    /// `Ok(None)` when the metadata service has no match.
    async fn convert(&self, kind: MediaKind, identifier: &Identifier) -> Result<Option<Identifier>, SourceError>;

    /// Movies by TMDB id, series by TVDB id, and episodes by their
    /// `thetvdb://series/season/episode` reference.
    fn accepts(&self, kind: MediaKind, identifier: &Identifier) -> bool {
        match (kind, identifier.namespace) {
            (MediaKind::Movie, Namespace::Tmdb) | (MediaKind::Show, Namespace::Tvdb) => true,
            (MediaKind::Episode, Namespace::Legacy) => legacy_episode_ref(&identifier.value).is_some(),
            _ => false,
        }
    }
}

/// Series id, season and episode of a legacy `thetvdb://81189/1/2` reference.
pub fn legacy_episode_ref(value: &str) -> Option<(&str, &str, &str)> {
    let path = value.strip_prefix("thetvdb://")?;
    let mut parts = path.split('/');
    let (series, season, episode) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || [series, season, episode].iter().any(|p| p.is_empty()) {
        return None;
    }
    Some((series, season, episode))
}
