use std::collections::BTreeSet;
use tracing::warn;
use watchsync_models::{normalize_username, ServerUser};

/// Case-insensitive set of user names to process; empty means everyone.
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    names: BTreeSet<String>,
}

impl UserFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| normalize_username(n.as_ref()))
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.names.is_empty()
    }

    pub fn matches(&self, user: &ServerUser) -> bool {
        self.is_all() || user.aliases().iter().any(|a| self.names.contains(a))
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.is_all() || self.names.contains(&normalize_username(name))
    }

    /// Configured names no user in `users` answers to.
    pub fn unmatched(&self, users: &[ServerUser]) -> Vec<String> {
        self.names
            .iter()
            .filter(|name| !users.iter().any(|u| u.aliases().contains(*name)))
            .cloned()
            .collect()
    }
}

/// Users that pass the filter and have a usable name, in server order.
pub fn select_users(users: &[ServerUser], filter: &UserFilter) -> Vec<ServerUser> {
    users
        .iter()
        .filter(|user| {
            if user.display_name().is_empty() {
                warn!("Skipping user with id '{}': no username, email or title", user.id);
                return false;
            }
            filter.matches(user)
        })
        .cloned()
        .collect()
}

/// The destination account for a source user name.
///
/// An exact username match wins over a match on email or title.
pub fn find_user<'a>(users: &'a [ServerUser], name: &str) -> Option<&'a ServerUser> {
    let wanted = normalize_username(name);
    if wanted.is_empty() {
        return None;
    }
    users
        .iter()
        .find(|u| u.username.as_deref().map(normalize_username).as_deref() == Some(wanted.as_str()))
        .or_else(|| users.iter().find(|u| normalize_username(&u.display_name()) == wanted))
        .or_else(|| users.iter().find(|u| u.aliases().contains(&wanted)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<ServerUser> {
        let mut bob = ServerUser::new("2", "Bob");
        bob.email = Some("bob@example.com".to_string());
        let mut nameless = ServerUser::new("3", "");
        nameless.username = None;
        vec![ServerUser::owner("1", "Alice"), bob, nameless]
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let filter = UserFilter::new(["ALICE", " bob@example.com "]);
        let selected = select_users(&users(), &filter);
        let names: Vec<String> = selected.iter().map(|u| u.display_name()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_empty_filter_selects_everyone_with_a_name() {
        let selected = select_users(&users(), &UserFilter::all());
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[2].display_name(), "3");
    }

    #[test]
    fn test_unmatched_names() {
        let filter = UserFilter::new(["alice", "carol"]);
        assert_eq!(filter.unmatched(&users()), vec!["carol".to_string()]);
    }

    #[test]
    fn test_find_user_prefers_username() {
        let mut users = users();
        let mut impostor = ServerUser::new("9", "someone");
        impostor.title = Some("bob".to_string());
        users.insert(0, impostor);

        assert_eq!(find_user(&users, "BOB").unwrap().id, "2");
        assert_eq!(find_user(&users, "bob@example.com").unwrap().id, "2");
        assert!(find_user(&users, "carol").is_none());
        assert!(find_user(&users, "  ").is_none());
    }
}
