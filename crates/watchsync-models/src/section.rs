use serde::{Deserialize, Serialize};

use crate::media::MediaKind;

/// A library section on a media server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub kind: MediaKind,
    /// Metadata agent the section was created with, when the server reports one.
    pub agent: Option<String>,
}

impl Section {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind,
            agent: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// True when `selector` names this section by id or case-insensitive title.
    pub fn matches_selector(&self, selector: &str) -> bool {
        let selector = selector.trim();
        self.id == selector || self.title.eq_ignore_ascii_case(selector)
    }
}
