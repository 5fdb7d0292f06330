use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use watchsync_models::{AgentMode, Identifier, MediaItem, MediaKind, Namespace};
use watchsync_sources::GuidConverter;

use crate::cache::{CacheStore, CachedKeys, DisabledCache, ItemRef};

/// Normalized title/year/position composite used when identifiers cannot be compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FallbackKey {
    pub kind: MediaKind,
    pub title: String,
    pub year: Option<u32>,
    pub parent_title: Option<String>,
    pub parent_index: Option<u32>,
    pub index: Option<u32>,
}

impl FallbackKey {
    /// Same key with the year dropped; catalogs index this to allow year wildcards.
    pub fn without_year(&self) -> FallbackKey {
        FallbackKey {
            year: None,
            ..self.clone()
        }
    }
}

/// Opaque key under which a source item and a destination item are the same thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchKey {
    Identifier { kind: MediaKind, identifier: Identifier },
    Fallback(FallbackKey),
}

impl MatchKey {
    pub fn is_fallback(&self) -> bool {
        matches!(self, MatchKey::Fallback(_))
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchKey::Identifier { kind, identifier } => write!(f, "{}|{}", kind, identifier),
            MatchKey::Fallback(key) => {
                write!(f, "{}|{}", key.kind, key.title)?;
                if let Some(year) = key.year {
                    write!(f, "|{}", year)?;
                }
                if let Some(parent) = &key.parent_title {
                    write!(f, "|{}", parent)?;
                }
                match (key.parent_index, key.index) {
                    (Some(p), Some(i)) => write!(f, "|{}.{}", p, i),
                    (None, Some(i)) => write!(f, "|{}", i),
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Lower-case, collapse every run of non-alphanumerics to one space, trim.
pub fn normalize_title(title: &str) -> String {
    let mut normalized = String::with_capacity(title.len());
    let mut pending_space = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_space && !normalized.is_empty() {
                normalized.push(' ');
            }
            pending_space = false;
            normalized.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    normalized
}

/// Derives match keys for media items.
///
/// Key derivation itself is pure; the cache only saves repeated work
/// across runs and never changes the outcome.
#[derive(Clone)]
pub struct IdentityResolver {
    mode: AgentMode,
    cache: Arc<dyn CacheStore>,
    converter: Option<Arc<dyn GuidConverter>>,
}

impl IdentityResolver {
    pub fn new(mode: AgentMode) -> Self {
        Self {
            mode,
            cache: Arc::new(DisabledCache),
            converter: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    /// Give old-agent items a `plex:` identifier before keys are derived.
    /// `plex:` identifiers then count in every agent mode.
    pub fn with_converter(mut self, converter: Arc<dyn GuidConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    fn usable(&self, identifier: &Identifier) -> bool {
        match self.mode {
            AgentMode::Uniform => true,
            AgentMode::Mixed => {
                identifier.namespace.is_portable()
                    || (self.converter.is_some() && identifier.namespace == Namespace::Plex)
            }
        }
    }

    /// Add the converted identifier to an item that has no `plex:` one yet.
    ///
    /// Conversions are memoized in the cache, misses included. A failed
    /// lookup leaves the item as it was and is retried on the next run.
    pub async fn enrich(&self, item: &mut MediaItem) {
        let Some(converter) = &self.converter else {
            return;
        };
        if item.identifiers.iter().any(|id| id.namespace == Namespace::Plex) {
            return;
        }
        let Some(source) = item
            .identifiers
            .iter()
            .find(|id| converter.accepts(item.kind, id))
            .cloned()
        else {
            return;
        };

        let key = format!("{}|{}", item.kind, source);
        let converted = match self.cache.get_conversion(&key).await {
            Some(cached) => cached,
            None => match converter.convert(item.kind, &source).await {
                Ok(converted) => {
                    self.cache.put_conversion(&key, converted.clone()).await;
                    converted
                }
                Err(e) => {
                    warn!("Could not convert {} for {}: {}", source, item.describe(), e);
                    return;
                }
            },
        };
        match converted {
            Some(identifier) => {
                trace!("{} converted to {}", source, identifier);
                item.identifiers.push(identifier);
            }
            None => debug!("No conversion known for {} ({})", source, item.describe()),
        }
    }

    pub fn fallback_key(&self, item: &MediaItem) -> FallbackKey {
        let episodic = item.kind.is_episodic();
        FallbackKey {
            kind: item.kind,
            title: normalize_title(&item.title),
            year: item.year,
            parent_title: if episodic {
                item.parent_title.as_deref().map(normalize_title).filter(|t| !t.is_empty())
            } else {
                None
            },
            parent_index: if episodic { item.parent_index } else { None },
            index: if episodic { item.index } else { None },
        }
    }

    /// Every key the item may be matched under, best first: usable
    /// identifiers in namespace priority order, then the fallback key.
    pub fn resolve_candidates(&self, item: &MediaItem) -> Vec<MatchKey> {
        let mut identifiers: Vec<&Identifier> = item.identifiers.iter().filter(|id| self.usable(id)).collect();
        identifiers.sort();
        identifiers.dedup();

        let mut keys: Vec<MatchKey> = identifiers
            .into_iter()
            .map(|identifier| MatchKey::Identifier {
                kind: item.kind,
                identifier: identifier.clone(),
            })
            .collect();
        keys.push(MatchKey::Fallback(self.fallback_key(item)));
        keys
    }

    /// The single preferred key of an item.
    pub fn resolve(&self, item: &MediaItem) -> MatchKey {
        // resolve_candidates always ends with the fallback key
        let mut keys = self.resolve_candidates(item);
        keys.swap_remove(0)
    }

    /// `resolve_candidates`, memoized per (server, section, item) in the cache.
    pub async fn resolve_cached(&self, server_identity: &str, item: &MediaItem) -> Vec<MatchKey> {
        let item_ref = ItemRef {
            server: server_identity.to_string(),
            section: item.section_id.clone(),
            rating_key: item.rating_key.clone(),
            mode: self.mode,
            converting: self.converter.is_some(),
        };
        let fingerprint = fingerprint(item);

        if let Some(cached) = self.cache.get_keys(&item_ref).await {
            if cached.fingerprint == fingerprint {
                trace!("Match key cache hit for {}", item.rating_key);
                return cached.keys;
            }
        }

        let keys = self.resolve_candidates(item);
        self.cache
            .put_keys(
                item_ref,
                CachedKeys {
                    fingerprint,
                    keys: keys.clone(),
                },
            )
            .await;
        keys
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash of the metadata keys are derived from, so stale cache entries are detected.
///
/// Persisted in the cache file, so it must not change between builds or
/// platforms: FNV-1a over the JSON form of the fields.
pub(crate) fn fingerprint(item: &MediaItem) -> u64 {
    let fields = (
        item.kind,
        &item.title,
        item.year,
        &item.parent_title,
        item.parent_index,
        item.index,
        &item.identifiers,
    );
    let bytes = serde_json::to_vec(&fields).unwrap_or_default();
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use watchsync_sources::SourceError;

    /// TMDB 278 converts, 0 fails, anything else is unknown to the service.
    struct TableConverter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GuidConverter for TableConverter {
        async fn convert(&self, _kind: MediaKind, identifier: &Identifier) -> Result<Option<Identifier>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match identifier.value.as_str() {
                "278" => Ok(Some(Identifier::new(Namespace::Plex, "movie/shawshank"))),
                "0" => Err(SourceError::Unreachable("metadata service is down".to_string())),
                _ => Ok(None),
            }
        }
    }

    fn movie(title: &str, year: Option<u32>) -> MediaItem {
        let mut item = MediaItem::new("1", "1", MediaKind::Movie, title);
        item.year = year;
        item
    }

    fn episode(show: &str, season: u32, number: u32) -> MediaItem {
        MediaItem::new("2", "2", MediaKind::Episode, "Episode")
            .with_parent(show, Some(season))
            .with_index(number)
    }

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  The Lord of the Rings: The Two Towers "), "the lord of the rings the two towers");
        assert_eq!(normalize_title("Amélie!!"), "amélie");
        assert_eq!(normalize_title("WALL·E"), "wall e");
        assert_eq!(normalize_title("..."), "");
    }

    #[test]
    fn test_shared_identifier_gives_equal_keys() {
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let a = movie("Foo", Some(1999)).with_identifier(Identifier::new(Namespace::Imdb, "tt1"));
        let b = movie("Foo (Director's Cut)", None).with_identifier(Identifier::new(Namespace::Imdb, "tt1"));
        assert_eq!(resolver.resolve(&a), resolver.resolve(&b));
    }

    #[test]
    fn test_highest_priority_identifier_wins() {
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let item = movie("Foo", None)
            .with_identifier(Identifier::new(Namespace::Tmdb, "9"))
            .with_identifier(Identifier::new(Namespace::Plex, "movie/abc"))
            .with_identifier(Identifier::new(Namespace::Imdb, "tt1"));
        let keys = resolver.resolve_candidates(&item);
        assert_eq!(
            keys[0],
            MatchKey::Identifier {
                kind: MediaKind::Movie,
                identifier: Identifier::new(Namespace::Plex, "movie/abc")
            }
        );
        assert_eq!(keys.len(), 4);
        assert!(keys[3].is_fallback());
    }

    #[test]
    fn test_mixed_mode_ignores_agent_specific_namespaces() {
        let resolver = IdentityResolver::new(AgentMode::Mixed);
        let item = movie("Foo", Some(1999))
            .with_identifier(Identifier::new(Namespace::Plex, "movie/abc"))
            .with_identifier(Identifier::new(Namespace::Legacy, "thetvdb://1/2/3"));
        let key = resolver.resolve(&item);
        assert!(key.is_fallback());

        let with_imdb = item.with_identifier(Identifier::new(Namespace::Imdb, "tt1"));
        assert!(!resolver.resolve(&with_imdb).is_fallback());
    }

    #[test]
    fn test_fallback_equal_when_normalized_fields_equal() {
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let a = episode("Foo!", 1, 2).with_year(1999);
        let b = episode("foo", 1, 2).with_year(1999);
        assert_eq!(resolver.resolve(&a), resolver.resolve(&b));
    }

    #[test]
    fn test_fallback_differs_on_any_field() {
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let base = episode("Foo", 1, 2).with_year(1999);
        let key = resolver.resolve(&base);

        assert_ne!(key, resolver.resolve(&episode("Foo", 1, 3).with_year(1999)));
        assert_ne!(key, resolver.resolve(&episode("Foo", 2, 2).with_year(1999)));
        assert_ne!(key, resolver.resolve(&episode("Bar", 1, 2).with_year(1999)));
        assert_ne!(key, resolver.resolve(&episode("Foo", 1, 2).with_year(2000)));

        let mut retitled = base.clone();
        retitled.title = "Other".to_string();
        assert_ne!(key, resolver.resolve(&retitled));
    }

    #[test]
    fn test_movie_fallback_ignores_position_fields() {
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let a = movie("Foo", Some(1999)).with_index(3);
        let b = movie("Foo", Some(1999));
        assert_eq!(resolver.resolve(&a), resolver.resolve(&b));
    }

    #[test]
    fn test_match_key_display() {
        let resolver = IdentityResolver::new(AgentMode::Uniform);
        let key = resolver.resolve(&episode("Foo", 1, 2).with_year(1999));
        assert_eq!(key.to_string(), "show-episode|episode|1999|foo|1.2");
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let item = movie("Foo", Some(1999)).with_identifier(Identifier::new(Namespace::Imdb, "tt1"));
        // Pinned: the value is stored in cache files written by earlier runs
        assert_eq!(fingerprint(&item), 0x492d_d855_2dea_e725);

        let mut moved = item.clone();
        moved.rating_key = "99".to_string();
        assert_eq!(fingerprint(&moved), fingerprint(&item));
        assert_ne!(fingerprint(&movie("Foo", Some(2000))), fingerprint(&movie("Foo", Some(1999))));
    }

    #[tokio::test]
    async fn test_resolve_cached_matches_pure_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn CacheStore> = Arc::new(crate::cache::DiskCache::open(dir.path(), 24).unwrap());
        let resolver = IdentityResolver::new(AgentMode::Uniform).with_cache(cache.clone());
        let item = movie("Foo", Some(1999)).with_identifier(Identifier::new(Namespace::Imdb, "tt1"));

        let first = resolver.resolve_cached("srv", &item).await;
        let second = resolver.resolve_cached("srv", &item).await;
        assert_eq!(first, resolver.resolve_candidates(&item));
        assert_eq!(first, second);
        assert_eq!(cache.stats().await.key_entries, 1);

        // Metadata changed under the same rating key: recomputed, not served stale
        let renamed = movie("Bar", Some(1999));
        let keys = resolver.resolve_cached("srv", &renamed).await;
        assert_eq!(keys, resolver.resolve_candidates(&renamed));
    }

    fn converting(mode: AgentMode, cache: Arc<dyn CacheStore>) -> (IdentityResolver, Arc<TableConverter>) {
        let converter = Arc::new(TableConverter {
            calls: AtomicUsize::new(0),
        });
        let resolver = IdentityResolver::new(mode)
            .with_cache(cache)
            .with_converter(converter.clone());
        (resolver, converter)
    }

    fn tmdb_movie(rating_key: &str, tmdb: &str) -> MediaItem {
        MediaItem::new(rating_key, "1", MediaKind::Movie, "The Shawshank Redemption")
            .with_year(1994)
            .with_identifier(Identifier::new(Namespace::Tmdb, tmdb))
    }

    #[tokio::test]
    async fn test_enrich_adds_converted_identifier_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn CacheStore> = Arc::new(DiskCache::open(dir.path(), 24).unwrap());
        let (resolver, converter) = converting(AgentMode::Mixed, cache);

        let mut first = tmdb_movie("1", "278");
        resolver.enrich(&mut first).await;
        let mut second = tmdb_movie("2", "278");
        resolver.enrich(&mut second).await;

        let plex = Identifier::new(Namespace::Plex, "movie/shawshank");
        assert!(first.identifiers.contains(&plex));
        assert_eq!(first.identifiers, second.identifiers);
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            resolver.resolve(&first),
            MatchKey::Identifier {
                kind: MediaKind::Movie,
                identifier: plex
            }
        );

        let mut unknown = tmdb_movie("3", "279");
        resolver.enrich(&mut unknown).await;
        resolver.enrich(&mut unknown).await;
        assert_eq!(unknown.identifiers.len(), 1);
        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_enrich_leaves_item_alone_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 24).unwrap());
        let (resolver, converter) = converting(AgentMode::Uniform, cache.clone());

        let mut item = tmdb_movie("1", "0");
        resolver.enrich(&mut item).await;
        assert_eq!(item.identifiers.len(), 1);
        assert_eq!(cache.stats().await.conversion_entries, 0);

        let mut already = tmdb_movie("2", "278").with_identifier(Identifier::new(Namespace::Plex, "movie/x"));
        resolver.enrich(&mut already).await;
        let mut imdb_only = movie("Foo", None).with_identifier(Identifier::new(Namespace::Imdb, "tt1"));
        resolver.enrich(&mut imdb_only).await;
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(imdb_only.identifiers.len(), 1);
    }
}
