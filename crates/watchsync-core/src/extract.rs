use std::collections::HashMap;
use tracing::{debug, warn};
use watchsync_models::{MediaItem, Section, ServerUser, WatchState};
use watchsync_sources::{MediaServer, SourceError};

/// Reads per-user watch state from a server. Never mutates anything.
pub struct StateExtractor<'a> {
    server: &'a dyn MediaServer,
}

impl<'a> StateExtractor<'a> {
    pub fn new(server: &'a dyn MediaServer) -> Self {
        Self { server }
    }

    /// State of one item for one user, with the watched percentage filled in.
    pub async fn extract(&self, user: &ServerUser, item: &MediaItem) -> Result<WatchState, SourceError> {
        let state = self.server.get_watch_state(user, item).await?;
        Ok(state.with_percent_from(item.duration_ms))
    }

    /// State of every item in a section, keyed by rating key.
    ///
    /// Uses the server's per-section listing; when that fails, falls back
    /// to one read per item so a single bad item costs only itself. Items the
    /// server has no state for come back as the default (unwatched) state.
    /// Fails as a whole only when the user cannot reach the section at all.
    pub async fn extract_section(
        &self,
        user: &ServerUser,
        section: &Section,
        items: &[MediaItem],
    ) -> Result<HashMap<String, Result<WatchState, SourceError>>, SourceError> {
        let mut states = HashMap::with_capacity(items.len());

        match self.server.list_watch_states(user, section, items).await {
            Ok(mut bulk) => {
                for item in items {
                    let state = bulk.remove(&item.rating_key).unwrap_or_default();
                    states.insert(item.rating_key.clone(), Ok(state.with_percent_from(item.duration_ms)));
                }
            }
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                warn!(
                    "Bulk state read for '{}' in section '{}' failed ({}); reading items one by one",
                    user.display_name(),
                    section.title,
                    e
                );
                for item in items {
                    states.insert(item.rating_key.clone(), self.extract(user, item).await);
                }
            }
        }

        debug!(
            "Extracted {} states for '{}' in section '{}'",
            states.len(),
            user.display_name(),
            section.title
        );
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchsync_models::MediaKind;
    use watchsync_sources::InMemoryServer;

    fn server() -> InMemoryServer {
        InMemoryServer::new("source", "src")
            .with_section(
                Section::new("1", "Movies", MediaKind::Movie),
                vec![
                    MediaItem::new("10", "1", MediaKind::Movie, "Foo").with_duration_ms(1000),
                    MediaItem::new("11", "1", MediaKind::Movie, "Bar"),
                ],
            )
            .with_user(ServerUser::owner("1", "alice"))
            .with_state(
                "1",
                "10",
                WatchState {
                    view_offset_ms: Some(250),
                    ..WatchState::default()
                },
            )
    }

    #[tokio::test]
    async fn test_extract_fills_percent() {
        let server = server();
        let user = ServerUser::owner("1", "alice");
        let item = MediaItem::new("10", "1", MediaKind::Movie, "Foo").with_duration_ms(1000);
        let state = StateExtractor::new(&server).extract(&user, &item).await.unwrap();
        assert_eq!(state.view_percent, Some(0.25));
        assert!(!state.is_watched);
    }

    #[tokio::test]
    async fn test_extract_section_defaults_missing_states() {
        let server = server();
        let user = ServerUser::owner("1", "alice");
        let section = Section::new("1", "Movies", MediaKind::Movie);
        let items = server.list_items(&section).await.unwrap();

        let states = StateExtractor::new(&server)
            .extract_section(&user, &section, &items)
            .await
            .unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states["11"].as_ref().unwrap(), &WatchState::default());
        assert_eq!(states["10"].as_ref().unwrap().view_offset_ms, Some(250));
    }

    #[tokio::test]
    async fn test_extract_section_fails_for_unknown_user() {
        let server = server();
        let stranger = ServerUser::new("9", "mallory");
        let section = Section::new("1", "Movies", MediaKind::Movie);
        let items = server.list_items(&section).await.unwrap();

        let result = StateExtractor::new(&server)
            .extract_section(&stranger, &section, &items)
            .await;
        assert!(result.unwrap_err().is_connectivity());
    }
}
