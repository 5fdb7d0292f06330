use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use watchsync_models::{AgentMode, Identifier, MediaItem};

use crate::cache_storage::{CacheStorage, CACHE_FORMAT_VERSION};
use crate::identity::MatchKey;

/// Raw reference of an item on one server, plus the agent mode keys were derived under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemRef {
    pub server: String,
    pub section: String,
    pub rating_key: String,
    pub mode: AgentMode,
    /// Keys derived with converted identifiers in play.
    pub converting: bool,
}

impl ItemRef {
    fn storage_key(&self) -> String {
        let mut key = format!("{}|{}|{}|{}", self.server, self.section, self.rating_key, self.mode.as_str());
        if self.converting {
            key.push_str("|converted");
        }
        key
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedKeys {
    pub fingerprint: u64,
    pub keys: Vec<MatchKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedListing {
    pub cached_at: DateTime<Utc>,
    pub items: Vec<MediaItem>,
}

/// Everything persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheData {
    pub version: u32,
    pub keys: HashMap<String, CachedKeys>,
    pub listings: HashMap<String, CachedListing>,
    /// Old-agent identifier to its converted form; `None` records a known miss.
    pub conversions: HashMap<String, Option<Identifier>>,
}

impl Default for CacheData {
    fn default() -> Self {
        Self {
            version: CACHE_FORMAT_VERSION,
            keys: HashMap::new(),
            listings: HashMap::new(),
            conversions: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub key_entries: usize,
    pub listing_entries: usize,
    pub conversion_entries: usize,
    pub hits: usize,
    pub misses: usize,
}

fn listing_key(server: &str, section: &str) -> String {
    format!("{}|{}", server, section)
}

/// Shared store of derived match keys and section listings.
///
/// Safe to use from many workers at once; concurrent writes to the same
/// key resolve last-write-wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_keys(&self, item: &ItemRef) -> Option<CachedKeys>;

    async fn put_keys(&self, item: ItemRef, keys: CachedKeys);

    /// A listing younger than the configured time-to-live.
    async fn get_listing(&self, server: &str, section: &str) -> Option<Vec<MediaItem>>;

    async fn put_listing(&self, server: &str, section: &str, items: Vec<MediaItem>);

    /// Outer `None` when the identifier was never converted.
    async fn get_conversion(&self, key: &str) -> Option<Option<Identifier>>;

    async fn put_conversion(&self, key: &str, converted: Option<Identifier>);

    /// Persist pending changes.
    async fn flush(&self) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn stats(&self) -> CacheStats;

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Cache that remembers nothing.
pub struct DisabledCache;

#[async_trait]
impl CacheStore for DisabledCache {
    async fn get_keys(&self, _item: &ItemRef) -> Option<CachedKeys> {
        None
    }

    async fn put_keys(&self, _item: ItemRef, _keys: CachedKeys) {}

    async fn get_listing(&self, _server: &str, _section: &str) -> Option<Vec<MediaItem>> {
        None
    }

    async fn put_listing(&self, _server: &str, _section: &str, _items: Vec<MediaItem>) {}

    async fn get_conversion(&self, _key: &str) -> Option<Option<Identifier>> {
        None
    }

    async fn put_conversion(&self, _key: &str, _converted: Option<Identifier>) {}

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> CacheStats {
        CacheStats::default()
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// In-memory cache backed by a single file in the cache directory.
pub struct DiskCache {
    dir: PathBuf,
    storage: CacheStorage,
    data: RwLock<CacheData>,
    listing_ttl: Option<Duration>,
    dirty: AtomicBool,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl DiskCache {
    /// Open the cache in `dir`. A `listing_ttl_hours` of 0 disables listing reuse.
    pub fn open(dir: &Path, listing_ttl_hours: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let storage = CacheStorage::new(dir);
        let data = storage.load()?;
        let listing_ttl = (listing_ttl_hours > 0).then(|| Duration::hours(listing_ttl_hours as i64));

        Ok(Self {
            dir: dir.to_path_buf(),
            storage,
            data: RwLock::new(data),
            listing_ttl,
            dirty: AtomicBool::new(false),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    async fn get_keys(&self, item: &ItemRef) -> Option<CachedKeys> {
        let found = self.data.read().await.keys.get(&item.storage_key()).cloned();
        self.record(found.is_some());
        found
    }

    async fn put_keys(&self, item: ItemRef, keys: CachedKeys) {
        self.data.write().await.keys.insert(item.storage_key(), keys);
        self.dirty.store(true, Ordering::Release);
    }

    async fn get_listing(&self, server: &str, section: &str) -> Option<Vec<MediaItem>> {
        let ttl = self.listing_ttl?;
        let key = listing_key(server, section);
        let data = self.data.read().await;
        let found = match data.listings.get(&key) {
            Some(listing) if Utc::now() - listing.cached_at < ttl => {
                debug!("Cache hit: listing for section {} ({} items)", section, listing.items.len());
                Some(listing.items.clone())
            }
            Some(_) => {
                debug!("Cache expired: listing for section {}", section);
                None
            }
            None => None,
        };
        self.record(found.is_some());
        found
    }

    async fn put_listing(&self, server: &str, section: &str, items: Vec<MediaItem>) {
        if self.listing_ttl.is_none() {
            return;
        }
        let listing = CachedListing {
            cached_at: Utc::now(),
            items,
        };
        self.data
            .write()
            .await
            .listings
            .insert(listing_key(server, section), listing);
        self.dirty.store(true, Ordering::Release);
    }

    async fn get_conversion(&self, key: &str) -> Option<Option<Identifier>> {
        let found = self.data.read().await.conversions.get(key).cloned();
        self.record(found.is_some());
        found
    }

    async fn put_conversion(&self, key: &str, converted: Option<Identifier>) {
        self.data.write().await.conversions.insert(key.to_string(), converted);
        self.dirty.store(true, Ordering::Release);
    }

    async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            debug!("Cache unchanged, nothing to flush");
            return Ok(());
        }
        let data = self.data.read().await;
        if let Err(e) = self.storage.save(&data) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.data.write().await = CacheData::default();
        self.dirty.store(false, Ordering::Release);
        if self.storage.remove()? {
            info!("Removed cache file {:?}", self.storage.path());
        }
        Ok(())
    }

    async fn stats(&self) -> CacheStats {
        let data = self.data.read().await;
        CacheStats {
            key_entries: data.keys.len(),
            listing_entries: data.listings.len(),
            conversion_entries: data.conversions.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache handle for the given settings; falls back to no cache if the directory is unusable.
pub fn open_cache(enabled: bool, dir: &Path, listing_ttl_hours: u64) -> std::sync::Arc<dyn CacheStore> {
    if !enabled {
        info!("Cache disabled");
        return std::sync::Arc::new(DisabledCache);
    }
    match DiskCache::open(dir, listing_ttl_hours) {
        Ok(cache) => std::sync::Arc::new(cache),
        Err(e) => {
            warn!("Could not open cache in {:?}: {}. Continuing without cache.", dir, e);
            std::sync::Arc::new(DisabledCache)
        }
    }
}
