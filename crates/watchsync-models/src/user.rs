use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Canonical form used whenever user names are compared across servers.
pub fn normalize_username(name: &str) -> String {
    name.trim().to_lowercase()
}

/// An account with access to a media server: the owner or a shared user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerUser {
    pub id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub title: Option<String>,
    pub is_owner: bool,
    /// Sections this user can see; `None` means every section.
    pub section_ids: Option<Vec<String>>,
}

impl ServerUser {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: Some(username.into()),
            email: None,
            title: None,
            is_owner: false,
            section_ids: None,
        }
    }

    pub fn owner(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            is_owner: true,
            ..Self::new(id, username)
        }
    }

    pub fn with_sections<I, S>(mut self, sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.section_ids = Some(sections.into_iter().map(Into::into).collect());
        self
    }

    /// Username, then email, then title, then id; the first non-blank wins.
    pub fn display_name(&self) -> String {
        [&self.username, &self.email, &self.title]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| self.id.trim())
            .to_string()
    }

    /// Every normalized name this user may be referred to by.
    pub fn aliases(&self) -> BTreeSet<String> {
        [&self.username, &self.email, &self.title]
            .into_iter()
            .flatten()
            .map(|s| normalize_username(s))
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn matches_name(&self, name: &str) -> bool {
        let name = normalize_username(name);
        !name.is_empty() && self.aliases().contains(&name)
    }

    pub fn can_see(&self, section_id: &str) -> bool {
        match &self.section_ids {
            None => true,
            Some(ids) => ids.iter().any(|id| id == section_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_fallback() {
        let mut user = ServerUser::new("7", "");
        user.email = Some("  ".to_string());
        user.title = Some("Alice Home".to_string());
        assert_eq!(user.display_name(), "Alice Home");

        user.title = None;
        assert_eq!(user.display_name(), "7");
    }

    #[test]
    fn test_matches_name_is_case_insensitive() {
        let mut user = ServerUser::new("1", "Alice");
        user.email = Some("alice@example.com".to_string());
        assert!(user.matches_name(" ALICE "));
        assert!(user.matches_name("Alice@Example.com"));
        assert!(!user.matches_name("bob"));
        assert!(!user.matches_name(""));
    }

    #[test]
    fn test_section_visibility() {
        let user = ServerUser::new("1", "bob").with_sections(["1", "3"]);
        assert!(user.can_see("3"));
        assert!(!user.can_see("2"));
        assert!(ServerUser::owner("0", "me").can_see("2"));
    }
}
