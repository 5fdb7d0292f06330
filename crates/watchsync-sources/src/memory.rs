use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use watchsync_models::{MediaItem, Section, ServerUser, WatchState};

use crate::error::SourceError;
use crate::traits::{MediaServer, ServerInfo};

/// A media server held entirely in memory.
///
/// Behaves like a real server for every read and mutation, and can be told
/// to fail specific sections or items. Used to exercise the sync engine
/// without a network.
pub struct InMemoryServer {
    label: String,
    identity: String,
    sections: Vec<Section>,
    items: HashMap<String, Vec<MediaItem>>,
    users: Vec<ServerUser>,
    states: RwLock<HashMap<(String, String), WatchState>>,
    unreachable: bool,
    failing_sections: HashSet<String>,
    failing_items: HashSet<String>,
    mutations: AtomicUsize,
    item_listings: AtomicUsize,
}

impl InMemoryServer {
    pub fn new(label: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            identity: identity.into(),
            sections: Vec::new(),
            items: HashMap::new(),
            users: Vec::new(),
            states: RwLock::new(HashMap::new()),
            unreachable: false,
            failing_sections: HashSet::new(),
            failing_items: HashSet::new(),
            mutations: AtomicUsize::new(0),
            item_listings: AtomicUsize::new(0),
        }
    }

    pub fn with_section(mut self, section: Section, items: Vec<MediaItem>) -> Self {
        self.items.insert(section.id.clone(), items);
        self.sections.push(section);
        self
    }

    pub fn with_user(mut self, user: ServerUser) -> Self {
        self.users.push(user);
        self
    }

    pub fn with_state(mut self, user_id: &str, rating_key: &str, state: WatchState) -> Self {
        self.states
            .get_mut()
            .insert((user_id.to_string(), rating_key.to_string()), state);
        self
    }

    /// Every call fails as if the server were down.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Listing this section fails.
    pub fn fail_section(mut self, section_id: &str) -> Self {
        self.failing_sections.insert(section_id.to_string());
        self
    }

    /// Mutations of this item are rejected.
    pub fn fail_mutations_for(mut self, rating_key: &str) -> Self {
        self.failing_items.insert(rating_key.to_string());
        self
    }

    pub async fn state(&self, user_id: &str, rating_key: &str) -> WatchState {
        self.states
            .read()
            .await
            .get(&(user_id.to_string(), rating_key.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of successful mutations so far.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of `list_items` calls so far.
    pub fn item_listing_count(&self) -> usize {
        self.item_listings.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), SourceError> {
        if self.unreachable {
            Err(SourceError::Unreachable(format!("{} is offline", self.identity)))
        } else {
            Ok(())
        }
    }

    fn check_known(&self, user: &ServerUser, item: &MediaItem) -> Result<(), SourceError> {
        self.check_reachable()?;
        if !self.users.iter().any(|u| u.id == user.id) {
            return Err(SourceError::Unauthorized(format!("unknown user {}", user.display_name())));
        }
        let known = self
            .items
            .get(&item.section_id)
            .map(|items| items.iter().any(|i| i.rating_key == item.rating_key))
            .unwrap_or(false);
        if !known {
            return Err(SourceError::NotFound(format!("item {}", item.rating_key)));
        }
        Ok(())
    }

    async fn mutate<F>(&self, user: &ServerUser, item: &MediaItem, change: F) -> Result<(), SourceError>
    where
        F: FnOnce(&mut WatchState) + Send,
    {
        self.check_known(user, item)?;
        if self.failing_items.contains(&item.rating_key) {
            return Err(SourceError::Rejected {
                status: 500,
                message: format!("mutation of {} refused", item.rating_key),
            });
        }
        let mut states = self.states.write().await;
        let state = states
            .entry((user.id.clone(), item.rating_key.clone()))
            .or_default();
        change(state);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MediaServer for InMemoryServer {
    fn label(&self) -> &str {
        &self.label
    }

    async fn connect(&self) -> Result<ServerInfo, SourceError> {
        self.check_reachable()?;
        Ok(ServerInfo {
            identity: self.identity.clone(),
            name: self.label.clone(),
            version: None,
        })
    }

    async fn list_sections(&self) -> Result<Vec<Section>, SourceError> {
        self.check_reachable()?;
        Ok(self.sections.clone())
    }

    async fn list_items(&self, section: &Section) -> Result<Vec<MediaItem>, SourceError> {
        self.check_reachable()?;
        self.item_listings.fetch_add(1, Ordering::SeqCst);
        if self.failing_sections.contains(&section.id) {
            return Err(SourceError::Rejected {
                status: 500,
                message: format!("section {} is unavailable", section.id),
            });
        }
        self.items
            .get(&section.id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("section {}", section.id)))
    }

    async fn list_users(&self) -> Result<Vec<ServerUser>, SourceError> {
        self.check_reachable()?;
        Ok(self.users.clone())
    }

    async fn get_watch_state(&self, user: &ServerUser, item: &MediaItem) -> Result<WatchState, SourceError> {
        self.check_known(user, item)?;
        Ok(self.state(&user.id, &item.rating_key).await)
    }

    async fn mark_watched(&self, user: &ServerUser, item: &MediaItem) -> Result<(), SourceError> {
        self.mutate(user, item, |state| {
            state.is_watched = true;
            state.view_count += 1;
            state.view_offset_ms = None;
            state.view_percent = None;
            state.last_viewed_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_unwatched(&self, user: &ServerUser, item: &MediaItem) -> Result<(), SourceError> {
        self.mutate(user, item, |state| {
            state.is_watched = false;
            state.view_count = 0;
            state.view_offset_ms = None;
            state.view_percent = None;
        })
        .await
    }

    async fn set_rating(&self, user: &ServerUser, item: &MediaItem, rating: f32) -> Result<(), SourceError> {
        self.mutate(user, item, |state| state.user_rating = Some(rating)).await
    }

    async fn update_progress(&self, user: &ServerUser, item: &MediaItem, offset_ms: u64) -> Result<(), SourceError> {
        self.mutate(user, item, |state| state.view_offset_ms = Some(offset_ms)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchsync_models::MediaKind;

    fn server() -> (InMemoryServer, ServerUser, MediaItem) {
        let user = ServerUser::owner("1", "alice");
        let item = MediaItem::new("10", "1", MediaKind::Movie, "Foo");
        let server = InMemoryServer::new("test", "mem-1")
            .with_section(Section::new("1", "Movies", MediaKind::Movie), vec![item.clone()])
            .with_user(user.clone());
        (server, user, item)
    }

    #[tokio::test]
    async fn test_mutations_update_state() {
        let (server, user, item) = server();
        server.mark_watched(&user, &item).await.unwrap();
        server.mark_watched(&user, &item).await.unwrap();
        server.set_rating(&user, &item, 7.0).await.unwrap();

        let state = server.get_watch_state(&user, &item).await.unwrap();
        assert!(state.is_watched);
        assert_eq!(state.view_count, 2);
        assert_eq!(state.user_rating, Some(7.0));
        assert_eq!(server.mutation_count(), 3);

        server.mark_unwatched(&user, &item).await.unwrap();
        let state = server.get_watch_state(&user, &item).await.unwrap();
        assert!(!state.is_watched);
        assert_eq!(state.view_count, 0);
        assert_eq!(state.user_rating, Some(7.0));
    }

    #[tokio::test]
    async fn test_default_bulk_listing() {
        let (server, user, item) = server();
        let server = server.with_state("1", "10", WatchState::watched(4));
        let section = server.list_sections().await.unwrap().remove(0);
        let states = server.list_watch_states(&user, &section, &[item]).await.unwrap();
        assert_eq!(states["10"].view_count, 4);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (server, user, item) = server();
        let server = server.fail_mutations_for("10").fail_section("1");
        assert!(server.mark_watched(&user, &item).await.is_err());
        let section = Section::new("1", "Movies", MediaKind::Movie);
        assert!(server.list_items(&section).await.is_err());

        let offline = InMemoryServer::new("down", "mem-2").unreachable();
        assert!(offline.connect().await.unwrap_err().is_connectivity());
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected() {
        let (server, _, item) = server();
        let stranger = ServerUser::new("99", "mallory");
        assert!(matches!(
            server.get_watch_state(&stranger, &item).await,
            Err(SourceError::Unauthorized(_))
        ));
    }
}
