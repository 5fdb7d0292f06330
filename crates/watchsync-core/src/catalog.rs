use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use watchsync_models::{MediaItem, Section, ServerUser};
use watchsync_sources::{MediaServer, ServerInfo, SourceError};

use crate::cache::CacheStore;
use crate::identity::{FallbackKey, IdentityResolver, MatchKey};
use crate::users::{select_users, UserFilter};

/// Section keys or titles to process, in processing order; empty means all.
#[derive(Debug, Clone, Default)]
pub struct SectionFilter {
    selectors: Vec<String>,
}

impl SectionFilter {
    pub fn new<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selectors: selectors
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.trim().is_empty())
                .collect(),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_all(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn matches_title(&self, title: &str) -> bool {
        self.is_all() || self.selectors.iter().any(|s| s.trim().eq_ignore_ascii_case(title.trim()))
    }

    /// Selected sections in filter order; without a filter, all of them ordered by key.
    pub fn select(&self, sections: &[Section]) -> (Vec<Section>, Vec<String>) {
        if self.is_all() {
            let mut all = sections.to_vec();
            all.sort_by(|a, b| section_order_key(&a.id).cmp(&section_order_key(&b.id)));
            return (all, Vec::new());
        }

        let mut selected: Vec<Section> = Vec::new();
        let mut unmatched = Vec::new();
        for selector in &self.selectors {
            let hits: Vec<&Section> = sections.iter().filter(|s| s.matches_selector(selector)).collect();
            if hits.is_empty() {
                unmatched.push(selector.clone());
            }
            for hit in hits {
                if !selected.iter().any(|s| s.id == hit.id) {
                    selected.push(hit.clone());
                }
            }
        }
        (selected, unmatched)
    }
}

/// Numeric keys sort numerically, anything else after them by text.
fn section_order_key(id: &str) -> (u64, String) {
    (id.parse().unwrap_or(u64::MAX), id.to_string())
}

/// Result of looking a foreign item up in a catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<'a> {
    /// Every visible item carrying the identifier, in section order. The
    /// same title kept in several sections is one item to the viewer.
    Identified(Vec<&'a MediaItem>),
    Matched(&'a MediaItem),
    /// Several items fit; `chosen` is the first in section order.
    Ambiguous { chosen: &'a MediaItem, candidates: usize },
    Unmatched,
}

/// Indexed view of one server's selected sections and users.
pub struct Catalog {
    server: ServerInfo,
    sections: Vec<Section>,
    items: Vec<MediaItem>,
    section_order: HashMap<String, usize>,
    by_key: HashMap<MatchKey, Vec<usize>>,
    by_title: HashMap<FallbackKey, Vec<usize>>,
    users: Vec<ServerUser>,
    section_failures: Vec<(Section, String)>,
    unmatched_selectors: Vec<String>,
}

impl Catalog {
    fn new(server: ServerInfo, users: Vec<ServerUser>) -> Self {
        Self {
            server,
            sections: Vec::new(),
            items: Vec::new(),
            section_order: HashMap::new(),
            by_key: HashMap::new(),
            by_title: HashMap::new(),
            users,
            section_failures: Vec::new(),
            unmatched_selectors: Vec::new(),
        }
    }

    fn add_section(&mut self, section: Section, items: Vec<MediaItem>, keys: Vec<Vec<MatchKey>>) {
        self.section_order.insert(section.id.clone(), self.sections.len());
        for (item, keys) in items.into_iter().zip(keys) {
            let idx = self.items.len();
            for key in keys {
                if let MatchKey::Fallback(fallback) = &key {
                    self.by_title.entry(fallback.without_year()).or_default().push(idx);
                }
                self.by_key.entry(key).or_default().push(idx);
            }
            self.items.push(item);
        }
        self.sections.push(section);
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Indexed sections in processing order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn users(&self) -> &[ServerUser] {
        &self.users
    }

    pub fn section_failures(&self) -> &[(Section, String)] {
        &self.section_failures
    }

    pub fn unmatched_selectors(&self) -> &[String] {
        &self.unmatched_selectors
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items_in<'a>(&'a self, section_id: &'a str) -> impl Iterator<Item = &'a MediaItem> + 'a {
        self.items.iter().filter(move |i| i.section_id == section_id)
    }

    /// Sections `user` can see, in processing order.
    pub fn visible_sections<'a>(&'a self, user: &'a ServerUser) -> impl Iterator<Item = &'a Section> + 'a {
        self.sections.iter().filter(move |s| user.can_see(&s.id))
    }

    fn visible(&self, idx: usize, user: &ServerUser) -> bool {
        user.can_see(&self.items[idx].section_id)
    }

    /// Section order, then rating key; duplicates removed.
    fn in_order(&self, mut hits: Vec<usize>) -> Vec<usize> {
        hits.sort_by(|a, b| {
            let (a, b) = (&self.items[*a], &self.items[*b]);
            let order = |i: &MediaItem| self.section_order.get(&i.section_id).copied().unwrap_or(usize::MAX);
            order(a)
                .cmp(&order(b))
                .then_with(|| section_order_key(&a.rating_key).cmp(&section_order_key(&b.rating_key)))
        });
        hits.dedup();
        hits
    }

    fn pick(&self, hits: Vec<usize>) -> Lookup<'_> {
        let hits = self.in_order(hits);
        match hits.len() {
            0 => Lookup::Unmatched,
            1 => Lookup::Matched(&self.items[hits[0]]),
            n => Lookup::Ambiguous {
                chosen: &self.items[hits[0]],
                candidates: n,
            },
        }
    }

    /// Find the items in this catalog that correspond to `item`, among those `user` can see.
    ///
    /// Identifier keys are tried in priority order, and the first one with
    /// a hit returns every copy. Without an identifier hit, the fallback key
    /// is matched with the year as a wildcard when either side lacks one;
    /// an exact year is preferred and at most one item is chosen.
    pub fn lookup(&self, resolver: &IdentityResolver, item: &MediaItem, user: &ServerUser) -> Lookup<'_> {
        for key in resolver.resolve_candidates(item) {
            match key {
                MatchKey::Identifier { .. } => {
                    let hits: Vec<usize> = self
                        .by_key
                        .get(&key)
                        .map(|hits| hits.iter().copied().filter(|i| self.visible(*i, user)).collect())
                        .unwrap_or_default();
                    if !hits.is_empty() {
                        let copies = self.in_order(hits).into_iter().map(|i| &self.items[i]).collect();
                        return Lookup::Identified(copies);
                    }
                }
                MatchKey::Fallback(fallback) => {
                    let hits: Vec<usize> = self
                        .by_title
                        .get(&fallback.without_year())
                        .map(|hits| hits.iter().copied().filter(|i| self.visible(*i, user)).collect())
                        .unwrap_or_default();

                    let Some(year) = fallback.year else {
                        return self.pick(hits);
                    };
                    let (exact, wildcard): (Vec<usize>, Vec<usize>) = hits
                        .into_iter()
                        .filter(|i| self.items[*i].year.map_or(true, |y| y == year))
                        .partition(|i| self.items[*i].year == Some(year));
                    return if exact.is_empty() {
                        self.pick(wildcard)
                    } else {
                        self.pick(exact)
                    };
                }
            }
        }
        Lookup::Unmatched
    }
}

/// Walks a server's sections and builds a `Catalog`.
pub struct CatalogIndexer<'a> {
    server: &'a dyn MediaServer,
    resolver: &'a IdentityResolver,
    cache: Arc<dyn CacheStore>,
}

impl<'a> CatalogIndexer<'a> {
    pub fn new(server: &'a dyn MediaServer, resolver: &'a IdentityResolver, cache: Arc<dyn CacheStore>) -> Self {
        Self { server, resolver, cache }
    }

    /// Index the selected sections and users of a connected server.
    ///
    /// Failing to list sections or users is an error; a section whose items
    /// cannot be listed is recorded and skipped.
    #[instrument(skip_all, fields(server = %self.server.label()))]
    pub async fn index(
        &self,
        info: &ServerInfo,
        sections: &SectionFilter,
        users: &UserFilter,
    ) -> Result<Catalog, SourceError> {
        let all_sections = self.server.list_sections().await?;
        let all_users = self.server.list_users().await?;

        let selected_users = select_users(&all_users, users);
        for name in users.unmatched(&all_users) {
            warn!("User '{}' is not on the {} server", name, self.server.label());
        }

        let (selected, unmatched_selectors) = sections.select(&all_sections);
        for selector in &unmatched_selectors {
            warn!("Section '{}' not found on the {} server", selector, self.server.label());
        }

        let mut catalog = Catalog::new(info.clone(), selected_users);
        catalog.unmatched_selectors = unmatched_selectors;

        for section in selected {
            let mut items = match self.section_items(info, &section).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(
                        operation = "index_section",
                        section = %section.title,
                        "Skipping section '{}' on {}: {}",
                        section.title,
                        self.server.label(),
                        e
                    );
                    catalog.section_failures.push((section, e.to_string()));
                    continue;
                }
            };

            let mut keys = Vec::with_capacity(items.len());
            for item in &mut items {
                self.resolver.enrich(item).await;
                keys.push(self.resolver.resolve_cached(&info.identity, item).await);
            }
            debug!("Indexed {} items from section '{}'", items.len(), section.title);
            catalog.add_section(section, items, keys);
        }

        info!(
            operation = "index",
            status = "complete",
            "Indexed {} items in {} sections for {} users on the {} server",
            catalog.len(),
            catalog.sections().len(),
            catalog.users().len(),
            self.server.label()
        );
        Ok(catalog)
    }

    async fn section_items(&self, info: &ServerInfo, section: &Section) -> Result<Vec<MediaItem>, SourceError> {
        if let Some(items) = self.cache.get_listing(&info.identity, &section.id).await {
            return Ok(items);
        }
        let items = self.server.list_items(section).await?;
        self.cache.put_listing(&info.identity, &section.id, items.clone()).await;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DisabledCache, DiskCache};
    use watchsync_models::{AgentMode, Identifier, MediaKind, Namespace};
    use watchsync_sources::InMemoryServer;

    fn movies() -> Section {
        Section::new("1", "Movies", MediaKind::Movie)
    }

    fn tv() -> Section {
        Section::new("2", "TV Shows", MediaKind::Episode)
    }

    fn imdb(value: &str) -> Identifier {
        Identifier::new(Namespace::Imdb, value)
    }

    fn server() -> InMemoryServer {
        InMemoryServer::new("destination", "dst")
            .with_section(
                movies(),
                vec![
                    MediaItem::new("11", "1", MediaKind::Movie, "Foo").with_year(1999).with_identifier(imdb("tt1")),
                    MediaItem::new("13", "1", MediaKind::Movie, "Bar"),
                    MediaItem::new("12", "1", MediaKind::Movie, "Bar"),
                    MediaItem::new("14", "1", MediaKind::Movie, "Baz").with_year(2005),
                    MediaItem::new("15", "1", MediaKind::Movie, "Baz"),
                ],
            )
            .with_section(
                tv(),
                vec![MediaItem::new("21", "2", MediaKind::Episode, "Pilot")
                    .with_parent("Foo", Some(1))
                    .with_index(2)],
            )
            .with_user(ServerUser::owner("1", "alice"))
            .with_user(ServerUser::new("2", "bob").with_sections(["2"]))
    }

    async fn index(server: &InMemoryServer, sections: SectionFilter) -> Catalog {
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let info = server.connect().await.unwrap();
        CatalogIndexer::new(server, &resolver, Arc::new(DisabledCache))
            .index(&info, &sections, &UserFilter::all())
            .await
            .unwrap()
    }

    #[test]
    fn test_section_filter_order_and_unmatched() {
        let sections = vec![movies(), tv()];
        let (selected, unmatched) = SectionFilter::new(["tv shows", "1", "Music"]).select(&sections);
        let ids: Vec<&str> = selected.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(unmatched, vec!["Music".to_string()]);

        let (all, _) = SectionFilter::all().select(&[tv(), movies()]);
        assert_eq!(all[0].id, "1");
    }

    #[tokio::test]
    async fn test_lookup_by_identifier() {
        let server = server();
        let catalog = index(&server, SectionFilter::all()).await;
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let alice = &catalog.users()[0];

        let wanted = MediaItem::new("", "", MediaKind::Movie, "Something Else").with_identifier(imdb("tt1"));
        match catalog.lookup(&resolver, &wanted, alice) {
            Lookup::Identified(items) => {
                let keys: Vec<&str> = items.iter().map(|i| i.rating_key.as_str()).collect();
                assert_eq!(keys, vec!["11"]);
            }
            other => panic!("unexpected lookup result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_by_identifier_returns_every_copy() {
        let server = server().with_section(
            Section::new("3", "Movies 4K", MediaKind::Movie),
            vec![MediaItem::new("31", "3", MediaKind::Movie, "Foo").with_identifier(imdb("tt1"))],
        );
        let catalog = index(&server, SectionFilter::all()).await;
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let alice = &catalog.users()[0];
        let bob = &catalog.users()[1];

        let wanted = MediaItem::new("", "", MediaKind::Movie, "Foo").with_identifier(imdb("tt1"));
        match catalog.lookup(&resolver, &wanted, alice) {
            Lookup::Identified(items) => {
                let keys: Vec<&str> = items.iter().map(|i| i.rating_key.as_str()).collect();
                assert_eq!(keys, vec!["11", "31"]);
            }
            other => panic!("unexpected lookup result: {:?}", other),
        }
        assert_eq!(catalog.lookup(&resolver, &wanted, bob), Lookup::Unmatched);
    }

    #[tokio::test]
    async fn test_lookup_fallback_year_wildcard_is_ambiguous() {
        let server = server();
        let catalog = index(&server, SectionFilter::all()).await;
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let alice = &catalog.users()[0];

        let wanted = MediaItem::new("", "", MediaKind::Movie, "Bar").with_year(2001);
        match catalog.lookup(&resolver, &wanted, alice) {
            Lookup::Ambiguous { chosen, candidates } => {
                assert_eq!(candidates, 2);
                assert_eq!(chosen.rating_key, "12");
            }
            other => panic!("unexpected lookup result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_prefers_exact_year() {
        let server = server();
        let catalog = index(&server, SectionFilter::all()).await;
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let alice = &catalog.users()[0];

        let exact = MediaItem::new("", "", MediaKind::Movie, "baz").with_year(2005);
        assert!(matches!(catalog.lookup(&resolver, &exact, alice), Lookup::Matched(i) if i.rating_key == "14"));

        let other_year = MediaItem::new("", "", MediaKind::Movie, "Baz").with_year(1990);
        assert!(matches!(catalog.lookup(&resolver, &other_year, alice), Lookup::Matched(i) if i.rating_key == "15"));

        let missing = MediaItem::new("", "", MediaKind::Movie, "Qux");
        assert_eq!(catalog.lookup(&resolver, &missing, alice), Lookup::Unmatched);
    }

    #[tokio::test]
    async fn test_lookup_respects_visibility() {
        let server = server();
        let catalog = index(&server, SectionFilter::all()).await;
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let bob = &catalog.users()[1];

        let movie = MediaItem::new("", "", MediaKind::Movie, "Foo").with_identifier(imdb("tt1"));
        assert_eq!(catalog.lookup(&resolver, &movie, bob), Lookup::Unmatched);

        let episode = MediaItem::new("", "", MediaKind::Episode, "Pilot")
            .with_parent("FOO", Some(1))
            .with_index(2);
        assert!(matches!(catalog.lookup(&resolver, &episode, bob), Lookup::Matched(_)));
        assert_eq!(catalog.visible_sections(bob).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_section_is_skipped() {
        let server = server().fail_section("1");
        let catalog = index(&server, SectionFilter::all()).await;
        assert_eq!(catalog.section_failures().len(), 1);
        assert_eq!(catalog.sections().len(), 1);
        assert_eq!(catalog.len(), 1);
    }

    #[tokio::test]
    async fn test_listing_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn CacheStore> = Arc::new(DiskCache::open(dir.path(), 24).unwrap());
        let resolver = IdentityResolver::new(AgentMode::Uniform).with_cache(cache.clone());
        let server = server();
        let info = server.connect().await.unwrap();
        let indexer = CatalogIndexer::new(&server, &resolver, cache.clone());

        let first = indexer.index(&info, &SectionFilter::all(), &UserFilter::all()).await.unwrap();
        let second = indexer.index(&info, &SectionFilter::all(), &UserFilter::all()).await.unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(server.item_listing_count(), 2);
    }
}
