use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use watchsync_models::{Identifier, MediaItem, MediaKind, Section, ServerUser, WatchState};

use crate::error::SourceError;
use crate::plex::api::{
    f64_field, parse_guids, parse_timestamp, str_field, u64_field, LibraryInfo, PlexHttpClient, TYPE_EPISODE,
    TYPE_MOVIE, TYPE_SHOW, TYPE_TRACK,
};
use crate::traits::{MediaServer, ServerInfo};

/// A Plex Media Server reached with the owner's token.
///
/// Shared users act through their own server access tokens, which are
/// looked up once in `list_users` and kept for the rest of the run.
pub struct PlexServer {
    label: String,
    api: PlexHttpClient,
    /// Section keys or titles the user selected; an `artist` section listed here is treated as audiobooks.
    audiobook_hints: Vec<String>,
    machine_identifier: Arc<RwLock<Option<String>>>,
    user_tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl PlexServer {
    pub fn new(
        label: impl Into<String>,
        url: &str,
        token: String,
        timeout: Duration,
        page_size: u32,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            label: label.into(),
            api: PlexHttpClient::new(url, token, timeout, page_size)?,
            audiobook_hints: Vec::new(),
            machine_identifier: Arc::new(RwLock::new(None)),
            user_tokens: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn with_audiobook_hints(mut self, hints: Vec<String>) -> Self {
        self.audiobook_hints = hints;
        self
    }

    async fn machine_identifier(&self) -> Result<String, SourceError> {
        {
            let cached = self.machine_identifier.read().await;
            if let Some(ref id) = *cached {
                return Ok(id.clone());
            }
        }
        let (identifier, _, _) = self.api.get_server_identity().await?;
        *self.machine_identifier.write().await = Some(identifier.clone());
        Ok(identifier)
    }

    async fn token_for(&self, user: &ServerUser) -> Result<String, SourceError> {
        if user.is_owner {
            return Ok(self.api.owner_token().to_string());
        }
        self.user_tokens
            .read()
            .await
            .get(&user.id)
            .cloned()
            .ok_or_else(|| SourceError::Unauthorized(format!("no server access token for user {}", user.display_name())))
    }

    fn classify(&self, library: &LibraryInfo) -> Option<MediaKind> {
        match library.type_.as_str() {
            "movie" => Some(MediaKind::Movie),
            "show" => Some(MediaKind::Episode),
            "artist" => {
                let audnexus = library
                    .agent
                    .as_deref()
                    .map(|a| a.to_lowercase().contains("audnexus"))
                    .unwrap_or(false);
                let selected = self
                    .audiobook_hints
                    .iter()
                    .any(|h| h.trim() == library.key || h.trim().eq_ignore_ascii_case(&library.title));
                (audnexus || selected).then_some(MediaKind::AudiobookTrack)
            }
            _ => None,
        }
    }

    /// Raw records of a section with the kind each projects onto. Show sections also
    /// carry their series records so series ratings travel.
    async fn list_raw(&self, token: &str, section: &Section) -> Result<Vec<(MediaKind, Value)>, SourceError> {
        let mut raw = Vec::new();
        for kind in listed_kinds(section.kind) {
            let plex_type = match kind {
                MediaKind::Movie => TYPE_MOVIE,
                MediaKind::Episode => TYPE_EPISODE,
                MediaKind::AudiobookTrack => TYPE_TRACK,
                MediaKind::Show => TYPE_SHOW,
            };
            let values = self.api.get_section_items(token, &section.id, plex_type).await?;
            raw.extend(values.into_iter().map(|v| (*kind, v)));
        }
        Ok(raw)
    }
}

fn listed_kinds(section_kind: MediaKind) -> &'static [MediaKind] {
    match section_kind {
        MediaKind::Episode => &[MediaKind::Episode, MediaKind::Show],
        MediaKind::Movie => &[MediaKind::Movie],
        MediaKind::AudiobookTrack => &[MediaKind::AudiobookTrack],
        MediaKind::Show => &[MediaKind::Show],
    }
}

/// Project a Plex metadata record onto `MediaItem`.
pub fn parse_item(value: &Value, section: &Section, kind: MediaKind) -> Option<MediaItem> {
    let rating_key = str_field(value, "ratingKey")?;
    let title = str_field(value, "title")?;

    let mut item = MediaItem::new(rating_key, section.id.clone(), kind, title);
    item.year = u64_field(value, "year")
        .or_else(|| u64_field(value, "parentYear"))
        .map(|y| y as u32);
    item.duration_ms = u64_field(value, "duration").filter(|d| *d > 0);
    item.index = u64_field(value, "index").map(|i| i as u32);

    match kind {
        MediaKind::Movie | MediaKind::Show => {}
        MediaKind::Episode => {
            item.parent_title = str_field(value, "grandparentTitle");
            item.parent_index = u64_field(value, "parentIndex").map(|i| i as u32);
        }
        MediaKind::AudiobookTrack => {
            item.parent_title = str_field(value, "parentTitle");
            item.parent_index = u64_field(value, "parentIndex").map(|i| i as u32);
        }
    }

    for guid in parse_guids(value) {
        if let Some(identifier) = Identifier::parse_guid(&guid) {
            item = item.with_identifier(identifier);
        }
    }
    Some(item)
}

/// Per-user playback fields of a Plex metadata record.
pub fn parse_state(value: &Value) -> WatchState {
    let view_count = u64_field(value, "viewCount").unwrap_or(0) as u32;
    let view_offset_ms = u64_field(value, "viewOffset").filter(|o| *o > 0);
    let state = WatchState {
        is_watched: view_count > 0,
        view_count,
        last_viewed_at: parse_timestamp(value, "lastViewedAt"),
        user_rating: f64_field(value, "userRating").map(|r| r as f32),
        view_offset_ms,
        view_percent: None,
    };
    state.with_percent_from(u64_field(value, "duration"))
}

/// Per-user fields of a series record. Its view count sums every episode play, so only
/// a fully watched series counts as watched.
pub fn parse_show_state(value: &Value) -> WatchState {
    let leaves = u64_field(value, "leafCount").unwrap_or(0);
    let viewed = u64_field(value, "viewedLeafCount").unwrap_or(0);
    let is_watched = leaves > 0 && viewed >= leaves;
    WatchState {
        is_watched,
        view_count: u32::from(is_watched),
        last_viewed_at: parse_timestamp(value, "lastViewedAt"),
        user_rating: f64_field(value, "userRating").map(|r| r as f32),
        view_offset_ms: None,
        view_percent: None,
    }
}

fn state_of(kind: MediaKind, value: &Value) -> WatchState {
    match kind {
        MediaKind::Show => parse_show_state(value),
        _ => parse_state(value),
    }
}

#[async_trait]
impl MediaServer for PlexServer {
    fn label(&self) -> &str {
        &self.label
    }

    async fn connect(&self) -> Result<ServerInfo, SourceError> {
        let (identity, name, version) = self.api.get_server_identity().await?;
        *self.machine_identifier.write().await = Some(identity.clone());
        info!(
            "Connected to {} server '{}' ({}) at {}",
            self.label,
            name,
            version.as_deref().unwrap_or("unknown version"),
            self.api.server_url()
        );
        Ok(ServerInfo { identity, name, version })
    }

    async fn list_sections(&self) -> Result<Vec<Section>, SourceError> {
        let libraries = self.api.get_libraries().await?;
        let mut sections = Vec::new();
        for library in libraries {
            match self.classify(&library) {
                Some(kind) => {
                    let mut section = Section::new(library.key, library.title, kind);
                    section.agent = library.agent;
                    sections.push(section);
                }
                None => {
                    info!(
                        "Skipping un-processable section '{}' (type {}) on {}",
                        library.title, library.type_, self.label
                    );
                }
            }
        }
        Ok(sections)
    }

    async fn list_items(&self, section: &Section) -> Result<Vec<MediaItem>, SourceError> {
        let raw = self.list_raw(self.api.owner_token(), section).await?;
        let total = raw.len();
        let items: Vec<MediaItem> = raw
            .iter()
            .filter_map(|(kind, v)| parse_item(v, section, *kind))
            .collect();
        if items.len() < total {
            warn!(
                "{}: {} of {} items in section '{}' had no rating key or title and were ignored",
                self.label,
                total - items.len(),
                total,
                section.title
            );
        }
        debug!("{}: listed {} items in section '{}'", self.label, items.len(), section.title);
        Ok(items)
    }

    async fn list_users(&self) -> Result<Vec<ServerUser>, SourceError> {
        let account = self.api.get_account().await?;
        let mut users = vec![ServerUser {
            id: account.id,
            username: account.username,
            email: account.email,
            title: account.title,
            is_owner: true,
            section_ids: None,
        }];

        let machine = self.machine_identifier().await?;
        let friends: HashMap<String, _> = self
            .api
            .get_friends()
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();
        let grants = self.api.get_shared_servers(&machine).await?;

        let mut tokens = self.user_tokens.write().await;
        for grant in grants {
            let friend = friends.get(&grant.user_id);
            let user = ServerUser {
                id: grant.user_id.clone(),
                username: grant.username.or_else(|| friend.and_then(|f| f.username.clone())),
                email: grant.email.or_else(|| friend.and_then(|f| f.email.clone())),
                title: friend.and_then(|f| f.title.clone()),
                is_owner: false,
                section_ids: Some(grant.section_keys),
            };
            match grant.access_token {
                Some(token) => {
                    tokens.insert(grant.user_id, token);
                }
                None => warn!(
                    "{}: no access token for shared user {}; their state cannot be read or written",
                    self.label,
                    user.display_name()
                ),
            }
            users.push(user);
        }

        info!("{}: found {} users ({} shared)", self.label, users.len(), users.len() - 1);
        Ok(users)
    }

    async fn get_watch_state(&self, user: &ServerUser, item: &MediaItem) -> Result<WatchState, SourceError> {
        let token = self.token_for(user).await?;
        let value = self.api.get_metadata(&token, &item.rating_key).await?;
        Ok(state_of(item.kind, &value))
    }

    async fn list_watch_states(
        &self,
        user: &ServerUser,
        section: &Section,
        _items: &[MediaItem],
    ) -> Result<HashMap<String, WatchState>, SourceError> {
        let token = self.token_for(user).await?;
        let raw = self.list_raw(&token, section).await?;
        Ok(raw
            .iter()
            .filter_map(|(kind, v)| str_field(v, "ratingKey").map(|key| (key, state_of(*kind, v))))
            .collect())
    }

    async fn mark_watched(&self, user: &ServerUser, item: &MediaItem) -> Result<(), SourceError> {
        let token = self.token_for(user).await?;
        Ok(self.api.scrobble(&token, &item.rating_key).await?)
    }

    async fn mark_unwatched(&self, user: &ServerUser, item: &MediaItem) -> Result<(), SourceError> {
        let token = self.token_for(user).await?;
        Ok(self.api.unscrobble(&token, &item.rating_key).await?)
    }

    async fn set_rating(&self, user: &ServerUser, item: &MediaItem, rating: f32) -> Result<(), SourceError> {
        let token = self.token_for(user).await?;
        Ok(self.api.set_rating(&token, &item.rating_key, rating).await?)
    }

    async fn update_progress(&self, user: &ServerUser, item: &MediaItem, offset_ms: u64) -> Result<(), SourceError> {
        let token = self.token_for(user).await?;
        Ok(self.api.update_progress(&token, &item.rating_key, offset_ms).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watchsync_models::Namespace;

    fn show_section() -> Section {
        Section::new("2", "TV Shows", MediaKind::Episode)
    }

    #[test]
    fn test_parse_episode() {
        let value = json!({
            "ratingKey": "1234",
            "title": "Pilot",
            "grandparentTitle": "Foo",
            "parentIndex": 1,
            "index": 2,
            "year": 1999,
            "duration": 1_800_000,
            "guid": "com.plexapp.agents.thetvdb://81189/1/2?lang=en"
        });
        let item = parse_item(&value, &show_section(), MediaKind::Episode).unwrap();
        assert_eq!(item.rating_key, "1234");
        assert_eq!(item.parent_title.as_deref(), Some("Foo"));
        assert_eq!(item.parent_index, Some(1));
        assert_eq!(item.index, Some(2));
        assert_eq!(item.identifiers.len(), 1);
        assert_eq!(item.identifiers[0].namespace, Namespace::Legacy);
    }

    #[test]
    fn test_parse_track_uses_album_as_parent() {
        let section = Section::new("9", "Audiobooks", MediaKind::AudiobookTrack);
        let value = json!({
            "ratingKey": "77",
            "title": "Chapter 1",
            "parentTitle": "The Book",
            "grandparentTitle": "The Author",
            "parentYear": 2010,
            "index": 1,
            "guid": "com.plexapp.agents.audnexus://B0X_us?lang=en"
        });
        let item = parse_item(&value, &section, MediaKind::AudiobookTrack).unwrap();
        assert_eq!(item.parent_title.as_deref(), Some("The Book"));
        assert_eq!(item.year, Some(2010));
        assert_eq!(item.identifiers[0].namespace, Namespace::Audnexus);
    }

    #[test]
    fn test_parse_item_requires_key_and_title() {
        assert!(parse_item(&json!({"title": "x"}), &show_section(), MediaKind::Episode).is_none());
        assert!(parse_item(&json!({"ratingKey": "1"}), &show_section(), MediaKind::Episode).is_none());
    }

    #[test]
    fn test_parse_state() {
        let value = json!({
            "viewCount": 3,
            "userRating": 8.5,
            "lastViewedAt": 1_600_000_000,
            "viewOffset": 600_000,
            "duration": 1_200_000
        });
        let state = parse_state(&value);
        assert!(state.is_watched);
        assert_eq!(state.view_count, 3);
        assert_eq!(state.user_rating, Some(8.5));
        assert_eq!(state.view_percent, Some(0.5));

        let untouched = parse_state(&json!({}));
        assert_eq!(untouched, WatchState::default());
    }

    #[test]
    fn test_parse_series_record() {
        let value = json!({
            "ratingKey": "200",
            "title": "Foo",
            "year": 2008,
            "viewCount": 14,
            "leafCount": 7,
            "viewedLeafCount": 7,
            "userRating": 9.0,
            "guid": "com.plexapp.agents.thetvdb://81189?lang=en"
        });
        let item = parse_item(&value, &show_section(), MediaKind::Show).unwrap();
        assert_eq!(item.kind, MediaKind::Show);
        assert_eq!(item.section_id, "2");
        assert!(item.parent_title.is_none());
        assert_eq!(item.describe(), "Foo (2008)");

        let state = state_of(MediaKind::Show, &value);
        assert!(state.is_watched);
        assert_eq!(state.view_count, 1);
        assert_eq!(state.user_rating, Some(9.0));

        let partial = parse_show_state(&json!({"viewCount": 3, "leafCount": 7, "viewedLeafCount": 3}));
        assert!(!partial.is_watched);
        assert_eq!(partial.view_count, 0);
        assert!(!partial.has_activity());
    }

    #[test]
    fn test_show_sections_list_series_too() {
        assert_eq!(listed_kinds(MediaKind::Episode), &[MediaKind::Episode, MediaKind::Show]);
        assert_eq!(listed_kinds(MediaKind::Movie), &[MediaKind::Movie]);
    }

    #[test]
    fn test_classify_audiobook_sections() {
        let server = PlexServer::new("source", "http://localhost:32400", "t".to_string(), Duration::from_secs(5), 50)
            .unwrap()
            .with_audiobook_hints(vec!["Books".to_string()]);
        let library = |type_: &str, title: &str, agent: Option<&str>| LibraryInfo {
            key: "1".to_string(),
            type_: type_.to_string(),
            title: title.to_string(),
            agent: agent.map(str::to_string),
        };

        assert_eq!(server.classify(&library("movie", "Movies", None)), Some(MediaKind::Movie));
        assert_eq!(
            server.classify(&library("artist", "Audio", Some("com.plexapp.agents.audnexus"))),
            Some(MediaKind::AudiobookTrack)
        );
        assert_eq!(server.classify(&library("artist", "books", None)), Some(MediaKind::AudiobookTrack));
        assert_eq!(server.classify(&library("artist", "Music", None)), None);
        assert_eq!(server.classify(&library("photo", "Photos", None)), None);
    }
}
