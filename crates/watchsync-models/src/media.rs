use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identifier::Identifier;

/// Kind of playable item a library section holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    #[serde(rename = "movie")]
    Movie,
    #[serde(rename = "show-episode", alias = "episode")]
    Episode,
    #[serde(rename = "audiobook-track", alias = "track", alias = "audiobook")]
    AudiobookTrack,
    /// A whole series; only its rating and fully-watched flag travel.
    #[serde(rename = "show")]
    Show,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Episode => "show-episode",
            MediaKind::AudiobookTrack => "audiobook-track",
            MediaKind::Show => "show",
        }
    }

    /// Episodic kinds need the parent title and index to be told apart.
    pub fn is_episodic(&self) -> bool {
        matches!(self, MediaKind::Episode | MediaKind::AudiobookTrack)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One playable unit in a library section, projected from whatever the server returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    /// Server-local reference used for reads, mutations and cache keys.
    pub rating_key: String,
    pub section_id: String,
    pub kind: MediaKind,
    pub identifiers: Vec<Identifier>,
    pub title: String,
    pub year: Option<u32>,
    /// Show title for episodes, book title for audiobook tracks.
    pub parent_title: Option<String>,
    /// Season number for episodes, disc number for tracks.
    pub parent_index: Option<u32>,
    /// Episode or track number.
    pub index: Option<u32>,
    pub duration_ms: Option<u64>,
}

impl MediaItem {
    pub fn new(rating_key: impl Into<String>, section_id: impl Into<String>, kind: MediaKind, title: impl Into<String>) -> Self {
        Self {
            rating_key: rating_key.into(),
            section_id: section_id.into(),
            kind,
            identifiers: Vec::new(),
            title: title.into(),
            year: None,
            parent_title: None,
            parent_index: None,
            index: None,
            duration_ms: None,
        }
    }

    pub fn with_year(mut self, year: u32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_identifier(mut self, identifier: Identifier) -> Self {
        if !self.identifiers.contains(&identifier) {
            self.identifiers.push(identifier);
        }
        self
    }

    pub fn with_parent(mut self, parent_title: impl Into<String>, parent_index: Option<u32>) -> Self {
        self.parent_title = Some(parent_title.into());
        self.parent_index = parent_index;
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Short human label for logs, e.g. `Foo (1999) S01E02`.
    pub fn describe(&self) -> String {
        let mut label = match &self.parent_title {
            Some(parent) if self.kind.is_episodic() => format!("{} - {}", parent, self.title),
            _ => self.title.clone(),
        };
        if let Some(year) = self.year {
            label.push_str(&format!(" ({})", year));
        }
        match (self.kind, self.parent_index, self.index) {
            (MediaKind::Episode, Some(season), Some(episode)) => {
                label.push_str(&format!(" S{:02}E{:02}", season, episode));
            }
            (MediaKind::AudiobookTrack, _, Some(track)) => {
                label.push_str(&format!(" #{}", track));
            }
            _ => {}
        }
        label
    }
}
