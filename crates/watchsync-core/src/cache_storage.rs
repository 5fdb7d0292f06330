use anyhow::Result;
use bincode::{deserialize, serialize};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache::CacheData;

pub const CACHE_FORMAT_VERSION: u32 = 2;

/// On-disk form of the match cache: bincode, gzip-compressed, replaced atomically.
pub struct CacheStorage {
    cache_path: PathBuf,
}

impl CacheStorage {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            cache_path: cache_dir.join("watchsync-cache.bin"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    /// Load the cache, starting empty when the file is missing or unreadable.
    pub fn load(&self) -> Result<CacheData> {
        if !self.cache_path.exists() {
            debug!("Cache file {:?} does not exist, starting with an empty cache", self.cache_path);
            return Ok(CacheData::default());
        }

        let start = std::time::Instant::now();
        let data = std::fs::read(&self.cache_path)?;

        let mut decompressed = Vec::new();
        let decoded = GzDecoder::new(&data[..])
            .read_to_end(&mut decompressed)
            .map_err(anyhow::Error::from)
            .and_then(|_| deserialize::<CacheData>(&decompressed).map_err(anyhow::Error::from));

        let cache = match decoded {
            Ok(cache) if cache.version == CACHE_FORMAT_VERSION => cache,
            Ok(cache) => {
                self.backup(&format!("format version {} != {}", cache.version, CACHE_FORMAT_VERSION));
                return Ok(CacheData::default());
            }
            Err(e) => {
                self.backup(&e.to_string());
                return Ok(CacheData::default());
            }
        };

        info!(
            "Loaded cache: {} key entries, {} section listings, {} conversions in {:?}",
            cache.keys.len(),
            cache.listings.len(),
            cache.conversions.len(),
            start.elapsed()
        );
        Ok(cache)
    }

    fn backup(&self, reason: &str) {
        let backup_path = self.cache_path.with_extension("bin.bak");
        match std::fs::rename(&self.cache_path, &backup_path) {
            Ok(()) => info!(
                "Cache file incompatible ({}). Moved it to {:?} and starting with an empty cache.",
                reason, backup_path
            ),
            Err(e) => warn!(
                "Cache file incompatible ({}) and could not be moved aside: {}. Starting with an empty cache.",
                reason, e
            ),
        }
    }

    pub fn save(&self, cache: &CacheData) -> Result<()> {
        let start = std::time::Instant::now();
        if let Some(parent) = self.cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let serialized = serialize(cache)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&serialized)?;
        let encoded = encoder.finish()?;

        let temp_path = self.cache_path.with_extension("tmp");
        std::fs::write(&temp_path, encoded)?;
        std::fs::rename(&temp_path, &self.cache_path)?;

        info!(
            "Saved cache: {} key entries, {} section listings in {:?}",
            cache.keys.len(),
            cache.listings.len(),
            start.elapsed()
        );
        Ok(())
    }

    pub fn remove(&self) -> Result<bool> {
        if self.cache_path.exists() {
            std::fs::remove_file(&self.cache_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn size(&self) -> Result<u64> {
        if self.cache_path.exists() {
            Ok(std::fs::metadata(&self.cache_path)?.len())
        } else {
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedListing;
    use chrono::Utc;
    use watchsync_models::{MediaItem, MediaKind};

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::new(dir.path());

        let mut data = CacheData::default();
        data.listings.insert(
            "srv|1".to_string(),
            CachedListing {
                cached_at: Utc::now(),
                items: vec![MediaItem::new("10", "1", MediaKind::Movie, "Foo").with_year(1999)],
            },
        );
        storage.save(&data).unwrap();
        assert!(storage.size().unwrap() > 0);

        let loaded = storage.load().unwrap();
        assert_eq!(loaded.listings["srv|1"].items[0].title, "Foo");
        assert_eq!(loaded.version, CACHE_FORMAT_VERSION);
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::new(dir.path());
        std::fs::write(storage.path(), b"not a cache").unwrap();

        let loaded = storage.load().unwrap();
        assert!(loaded.keys.is_empty());
        assert!(!storage.path().exists());
        assert!(dir.path().join("watchsync-cache.bin.bak").exists());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::new(dir.path());
        assert!(!storage.remove().unwrap());
        storage.save(&CacheData::default()).unwrap();
        assert!(storage.remove().unwrap());
    }
}
