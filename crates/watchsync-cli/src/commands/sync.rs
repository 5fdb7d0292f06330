use super::config::{load_config, load_credentials};
use super::sync_ui::SyncUI;
use crate::output::Output;
use crate::RunArgs;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use watchsync_config::{Config, CredentialStore, PathManager, Role};
use watchsync_core::{open_cache, CacheStore, RunReport, SyncOptions, SyncOrchestrator};
use watchsync_sources::{create_converter, create_server, MediaServer};

/// Everything a run needs, resolved from config, credentials and flags.
struct RunContext {
    config: Config,
    credentials: CredentialStore,
    paths: PathManager,
    options: SyncOptions,
    snapshot: PathBuf,
}

impl RunContext {
    fn load(args: &RunArgs, snapshot: Option<PathBuf>, dry_run: bool) -> Result<Self> {
        let paths = PathManager::default();
        let mut config = load_config(&paths)?;
        let credentials = load_credentials(&paths)?;

        if !args.user.is_empty() {
            config.sync.users = args.user.clone();
        }
        if !args.section.is_empty() {
            config.sync.sections = args.section.clone();
        }
        if let Some(workers) = args.workers {
            config.sync.workers = workers;
        }
        config
            .validate()
            .map_err(|e| eyre!("Configuration validation failed: {}", e))?;

        let snapshot = snapshot.unwrap_or_else(|| resolve_snapshot_path(&config, &paths));
        let options = SyncOptions::from_settings(&config.sync).with_dry_run(dry_run);
        Ok(Self {
            config,
            credentials,
            paths,
            options,
            snapshot,
        })
    }

    fn server(&self, role: Role) -> Result<Arc<dyn MediaServer>> {
        create_server(role, &self.config, &self.credentials)
            .map_err(|e| eyre!("Cannot set up the {} server: {}", role, e))
    }

    fn cache(&self) -> Arc<dyn CacheStore> {
        let dir = self.config.cache.dir.clone().unwrap_or_else(|| self.paths.cache_dir());
        open_cache(self.config.cache.enabled, &dir, self.config.cache.listing_ttl_hours)
    }

    fn orchestrator(&self, output: &Output, cancel: &CancellationToken) -> Result<SyncOrchestrator> {
        let orchestrator = SyncOrchestrator::new(self.options.clone())
            .with_cache(self.cache())
            .with_observer(Arc::new(SyncUI::new(output.is_human() && !output.is_quiet())))
            .with_cancellation(cancel.clone());
        let converter = create_converter(&self.config, &self.credentials)
            .map_err(|e| eyre!("Cannot set up GUID conversion: {}", e))?;
        Ok(match converter {
            Some(converter) => orchestrator.with_converter(converter),
            None => orchestrator,
        })
    }
}

/// A relative snapshot path in the config lives in the data directory.
fn resolve_snapshot_path(config: &Config, paths: &PathManager) -> PathBuf {
    if config.sync.snapshot.is_absolute() {
        config.sync.snapshot.clone()
    } else {
        paths.data_dir().join(&config.sync.snapshot)
    }
}

/// Cancel `token` on the first Ctrl-C so in-flight users can finish.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted: no new users will be started, waiting for in-flight users");
            token.cancel();
        }
    });
}

pub async fn run_export(args: RunArgs, snapshot: Option<PathBuf>, output: &Output) -> Result<i32> {
    tracing::debug!("Export command started");
    let ctx = RunContext::load(&args, snapshot, false)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let report = export(&ctx, output, &cancel).await?;
    output.report(&report);
    Ok(report.exit_code())
}

async fn export(ctx: &RunContext, output: &Output, cancel: &CancellationToken) -> Result<RunReport> {
    let source = ctx.server(Role::Source)?;
    let report = ctx
        .orchestrator(output, cancel)?
        .export_to_file(source.as_ref(), &ctx.snapshot)
        .await?;
    if report.cancelled {
        output.warn("Export cancelled, snapshot not written");
    } else {
        output.success(format!(
            "Exported {} records to {}",
            report.records_exported,
            ctx.snapshot.display()
        ));
    }
    Ok(report)
}

pub async fn run_import(args: RunArgs, snapshot: Option<PathBuf>, dry_run: bool, output: &Output) -> Result<i32> {
    tracing::debug!("Import command started");
    let ctx = RunContext::load(&args, snapshot, dry_run)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let report = import(&ctx, output, &cancel, &ctx.snapshot).await?;
    output.report(&report);
    Ok(report.exit_code())
}

async fn import(ctx: &RunContext, output: &Output, cancel: &CancellationToken, path: &Path) -> Result<RunReport> {
    if !path.exists() {
        return Err(eyre!(
            "Snapshot {} not found. Run 'watchsync export' first or pass --snapshot.",
            path.display()
        ));
    }
    let destination = ctx.server(Role::Destination)?;
    let report = ctx
        .orchestrator(output, cancel)?
        .import_from_file(destination.as_ref(), path)
        .await?;
    Ok(report)
}

/// Export to the snapshot file, then import it. Stops after the export if it did not complete.
pub async fn run_sync(args: RunArgs, snapshot: Option<PathBuf>, dry_run: bool, output: &Output) -> Result<i32> {
    tracing::debug!("Sync command started");
    let ctx = RunContext::load(&args, snapshot, dry_run)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let exported = export(&ctx, output, &cancel).await?;
    if exported.cancelled || exported.records_exported == 0 {
        output.report(&exported);
        if !exported.cancelled {
            output.warn("Nothing to import");
        }
        return Ok(exported.exit_code());
    }
    if !output.is_human() {
        output.report(&exported);
    }

    let imported = import(&ctx, output, &cancel, &ctx.snapshot).await?;
    output.report(&imported);
    Ok(exported.exit_code().max(imported.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_snapshot_lives_in_data_dir() {
        let paths = PathManager::with_base("/tmp/watchsync-test");
        let mut config = Config::default();
        assert_eq!(
            resolve_snapshot_path(&config, &paths),
            PathBuf::from("/tmp/watchsync-test/data/watched-history.json")
        );

        config.sync.snapshot = PathBuf::from("/srv/export.json");
        assert_eq!(resolve_snapshot_path(&config, &paths), PathBuf::from("/srv/export.json"));
    }
}
