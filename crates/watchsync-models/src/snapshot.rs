use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;
use crate::media::{MediaItem, MediaKind};
use crate::watch_state::WatchState;

/// One (user, item, state) triple in an exported snapshot.
///
/// Carries enough raw metadata for the importing side to derive its own
/// match key, whatever agent its library uses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub user: String,
    pub section_type: MediaKind,
    /// Title of the source section the item was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(flatten)]
    pub state: WatchState,
}

impl SnapshotRecord {
    pub fn from_item(user: impl Into<String>, section: Option<String>, item: &MediaItem, state: WatchState) -> Self {
        let mut identifiers: Vec<&Identifier> = item.identifiers.iter().collect();
        identifiers.sort();
        Self {
            user: user.into(),
            section_type: item.kind,
            section,
            title: item.title.clone(),
            year: item.year,
            parent_title: item.parent_title.clone(),
            parent_index: item.parent_index,
            index: item.index,
            identifiers: identifiers.into_iter().map(|id| id.to_string()).collect(),
            state,
        }
    }

    /// Rebuild item metadata for matching; identifiers that fail to parse are dropped.
    pub fn to_item(&self) -> MediaItem {
        let mut item = MediaItem::new(String::new(), String::new(), self.section_type, self.title.clone());
        item.year = self.year;
        item.parent_title = self.parent_title.clone();
        item.parent_index = self.parent_index;
        item.index = self.index;
        for raw in &self.identifiers {
            if let Some(id) = Identifier::parse_guid(raw) {
                item = item.with_identifier(id);
            }
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Namespace;

    #[test]
    fn test_record_json_shape_is_flat() {
        let item = MediaItem::new("5", "1", MediaKind::Movie, "Foo")
            .with_year(1999)
            .with_identifier(Identifier::new(Namespace::Tmdb, "9"))
            .with_identifier(Identifier::new(Namespace::Imdb, "tt1"));
        let record = SnapshotRecord::from_item("alice", None, &item, WatchState::watched(3).with_rating(8.5));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["view_count"], 3);
        assert_eq!(json["is_watched"], true);
        assert_eq!(json["section_type"], "movie");
        assert_eq!(json["identifiers"], serde_json::json!(["imdb:tt1", "tmdb:9"]));
        assert!(json.get("section").is_none());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = r#"{
            "user": "bob",
            "section_type": "show-episode",
            "title": "Pilot",
            "parent_title": "Foo",
            "index": 1,
            "identifiers": ["tvdb:123", "garbage"],
            "is_watched": true,
            "view_count": 1,
            "added_by_future_version": 42
        }"#;
        let record: SnapshotRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.state.view_count, 1);
        let item = record.to_item();
        assert_eq!(item.identifiers, vec![Identifier::new(Namespace::Tvdb, "123")]);
        assert_eq!(item.parent_title.as_deref(), Some("Foo"));
    }
}
