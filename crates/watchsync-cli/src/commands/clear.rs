use super::config::load_config;
use crate::output::Output;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::fs;
use watchsync_config::PathManager;
use watchsync_core::{CacheStore, DiskCache};

pub async fn run_clear(all: bool, cache: bool, credentials: bool, output: &Output) -> Result<()> {
    let path_manager = PathManager::default();

    if !(all || cache || credentials) {
        output.warn("No clear option specified. Use --cache, --credentials, or --all");
        output.info("\nExample: watchsync clear --cache");
        return Ok(());
    }

    if all || cache {
        clear_cache(&path_manager, output).await?;
    }
    if all || credentials {
        clear_credentials(&path_manager, output)?;
    }
    if all {
        output.success("Cache and credentials cleared");
    }
    Ok(())
}

async fn clear_cache(path_manager: &PathManager, output: &Output) -> Result<()> {
    let config = load_config(path_manager)?;
    let dir = config.cache.dir.unwrap_or_else(|| path_manager.cache_dir());
    if !dir.exists() {
        output.info("No cache found to clear");
        return Ok(());
    }

    // Opened directly so a disabled cache in the config can still be wiped.
    let cache = DiskCache::open(&dir, config.cache.listing_ttl_hours)
        .map_err(|e| eyre!("Failed to open cache at {}: {}", dir.display(), e))?;
    let stats = cache.stats().await;
    cache
        .clear()
        .await
        .map_err(|e| eyre!("Failed to clear cache at {}: {}", dir.display(), e))?;
    output.success(format!(
        "Cleared cache: {} ({} key entries, {} listings, {} conversions)",
        dir.display(),
        stats.key_entries,
        stats.listing_entries,
        stats.conversion_entries
    ));
    Ok(())
}

fn clear_credentials(path_manager: &PathManager, output: &Output) -> Result<()> {
    let credentials_file = path_manager.credentials_file();

    if credentials_file.exists() {
        fs::remove_file(&credentials_file).map_err(|e| {
            eyre!(
                "Failed to remove credentials file at {}: {}",
                credentials_file.display(),
                e
            )
        })?;
        output.success(format!("Cleared credentials: {}", credentials_file.display()));
    } else {
        output.info("No credentials file found to clear");
    }
    Ok(())
}
