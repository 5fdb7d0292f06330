use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use watchsync_config::{SyncSettings, MAX_WORKERS};
use watchsync_models::{normalize_username, AgentMode, ServerUser, SnapshotRecord};
use watchsync_sources::{GuidConverter, MediaServer};

use crate::apply::{ApplyOutcome, StateApplier};
use crate::cache::{CacheStore, DisabledCache};
use crate::catalog::{Catalog, CatalogIndexer, Lookup, SectionFilter};
use crate::error::SyncError;
use crate::extract::StateExtractor;
use crate::identity::IdentityResolver;
use crate::progress::ProgressTracker;
use crate::report::{FailureKind, RunMode, RunPhase, RunReport, WarningKind};
use crate::snapshot::{merge_records, Snapshot};
use crate::users::{find_user, UserFilter};

/// Log a progress line every this many records per user.
const PROGRESS_INTERVAL: usize = 100;

/// Hooks for rendering a run as it happens. Every method defaults to a no-op.
pub trait RunObserver: Send + Sync {
    fn phase_changed(&self, _phase: RunPhase) {}

    fn users_planned(&self, _count: usize) {}

    fn user_started(&self, _user: &str, _records: usize) {}

    fn record_done(&self, _user: &str) {}

    fn user_finished(&self, _user: &str, _report: &RunReport) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOptions {
    pub users: Vec<String>,
    pub sections: Vec<String>,
    pub agent_mode: AgentMode,
    pub workers: usize,
    pub include_unwatched: bool,
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            users: Vec::new(),
            sections: Vec::new(),
            agent_mode: AgentMode::default(),
            workers: 4,
            include_unwatched: false,
            dry_run: false,
        }
    }
}

impl SyncOptions {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            users: settings.users.clone(),
            sections: settings.sections.clone(),
            agent_mode: settings.agent_mode,
            workers: settings.workers,
            include_unwatched: settings.include_unwatched,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Drives export and import runs over a pool of per-user workers.
///
/// Users are independent units of work: each worker handles one user's
/// records from start to finish and returns a partial report, and the
/// partial reports are merged once every worker is done.
pub struct SyncOrchestrator {
    options: SyncOptions,
    cache: Arc<dyn CacheStore>,
    observer: Arc<dyn RunObserver>,
    cancel: CancellationToken,
    converter: Option<Arc<dyn GuidConverter>>,
}

impl SyncOrchestrator {
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options,
            cache: Arc::new(DisabledCache),
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
            converter: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Convert old-agent identifiers while indexing either server.
    pub fn with_converter(mut self, converter: Arc<dyn GuidConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Cancel this to stop dispatching users; users in flight stop at the next record.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    fn check_options(&self) -> Result<(), SyncError> {
        if self.options.workers == 0 || self.options.workers > MAX_WORKERS {
            return Err(SyncError::Configuration(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.options.workers
            )));
        }
        Ok(())
    }

    fn resolver(&self) -> IdentityResolver {
        let resolver = IdentityResolver::new(self.options.agent_mode).with_cache(self.cache.clone());
        match &self.converter {
            Some(converter) => resolver.with_converter(converter.clone()),
            None => resolver,
        }
    }

    fn enter(&self, report: &mut RunReport, phase: RunPhase) {
        debug!("Run phase: {}", phase);
        report.phase = phase;
        self.observer.phase_changed(phase);
    }

    fn abort(&self, error: SyncError) -> SyncError {
        tracing::error!(operation = "run", status = "aborted", error = %error, "Run aborted");
        self.observer.phase_changed(RunPhase::Aborted);
        error
    }

    /// Connect and index one server, turning failures into run-level errors.
    async fn index(
        &self,
        server: &dyn MediaServer,
        resolver: &IdentityResolver,
        report: &mut RunReport,
        sections: &SectionFilter,
        users: &UserFilter,
    ) -> Result<Catalog, SyncError> {
        let role = server.label().to_string();
        let info = server
            .connect()
            .await
            .map_err(|e| SyncError::connectivity(role.clone(), e))?;
        info!(
            operation = "connect",
            server = %info.name,
            version = info.version.as_deref().unwrap_or("unknown"),
            "Connected to the {} server",
            role
        );

        self.enter(report, RunPhase::Indexing);
        let catalog = CatalogIndexer::new(server, resolver, self.cache.clone())
            .index(&info, sections, users)
            .await
            .map_err(|e| SyncError::connectivity(role, e))?;

        for (section, message) in catalog.section_failures() {
            report.sections_failed += 1;
            report.fail(FailureKind::SectionUnavailable, None, Some(section.title.as_str()), message.clone());
        }
        for selector in catalog.unmatched_selectors() {
            report.warn(
                WarningKind::SelectorUnmatched,
                None,
                Some(selector.as_str()),
                format!("no section matches '{}' on the {} server", selector, server.label()),
            );
        }
        Ok(catalog)
    }

    async fn flush_cache(&self) {
        if let Err(e) = self.cache.flush().await {
            warn!("Failed to save cache: {}", e);
        }
    }

    /// Read the selected users' watch state from `source`.
    ///
    /// Returns no snapshot when the run was cancelled, so a partial export
    /// never replaces a complete one.
    #[instrument(skip_all, fields(server = %source.label()))]
    pub async fn export(&self, source: &dyn MediaServer) -> Result<(Option<Snapshot>, RunReport), SyncError> {
        let start = Instant::now();
        let mut report = RunReport::new(RunMode::Export);
        self.enter(&mut report, RunPhase::Init);
        self.check_options().map_err(|e| self.abort(e))?;

        let resolver = self.resolver();
        let user_filter = UserFilter::new(&self.options.users);
        let catalog = self
            .index(
                source,
                &resolver,
                &mut report,
                &SectionFilter::new(self.options.sections.clone()),
                &user_filter,
            )
            .await
            .map_err(|e| self.abort(e))?;

        for name in user_filter.unmatched(catalog.users()) {
            report.users_skipped += 1;
            report.warn(
                WarningKind::UserSkipped,
                Some(name.as_str()),
                None,
                format!("no user named '{}' on the {} server", name, source.label()),
            );
        }

        self.enter(&mut report, RunPhase::Extracting);
        let users = catalog.users().to_vec();
        self.observer.users_planned(users.len());
        info!(
            operation = "export",
            users = users.len(),
            workers = self.options.workers,
            "Exporting watch state of {} users",
            users.len()
        );

        let partials: Vec<(Vec<SnapshotRecord>, RunReport)> = stream::iter(users)
            .map(|user| self.export_user(source, &catalog, user))
            .buffer_unordered(self.options.workers)
            .collect()
            .await;

        self.enter(&mut report, RunPhase::Merging);
        let mut records = Vec::new();
        for (user_records, partial) in partials {
            records.extend(user_records);
            report.absorb(partial);
        }
        let records = merge_records(records, &resolver, &mut report);
        report.records_exported = records.len();
        self.flush_cache().await;

        let snapshot = if report.cancelled {
            warn!("Export cancelled; no snapshot written");
            None
        } else {
            Some(Snapshot::new(Some(catalog.server().name.clone()), records))
        };

        report.finish(start.elapsed());
        self.observer.phase_changed(report.phase);
        info!(
            operation = "export",
            status = %report.phase,
            "Export finished: {} records from {} users in {:.1}s",
            report.records_exported,
            report.users_processed,
            report.duration.as_secs_f64()
        );
        Ok((snapshot, report))
    }

    /// `export`, then write the snapshot to `path`.
    pub async fn export_to_file(&self, source: &dyn MediaServer, path: &Path) -> Result<RunReport, SyncError> {
        let (snapshot, report) = self.export(source).await?;
        if let Some(snapshot) = snapshot {
            snapshot.write(path).await?;
        }
        Ok(report)
    }

    async fn export_user(
        &self,
        source: &dyn MediaServer,
        catalog: &Catalog,
        user: ServerUser,
    ) -> (Vec<SnapshotRecord>, RunReport) {
        let mut report = RunReport::new(RunMode::Export);
        let name = user.display_name();
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return (Vec::new(), report);
        }

        let sections: Vec<_> = catalog.visible_sections(&user).cloned().collect();
        let total: usize = sections.iter().map(|s| catalog.items_in(&s.id).count()).sum();
        self.observer.user_started(&name, total);
        let mut tracker = ProgressTracker::new(format!("Export for '{}'", name), total, PROGRESS_INTERVAL);
        let extractor = StateExtractor::new(source);
        let mut records = Vec::new();

        'sections: for section in &sections {
            let items: Vec<_> = catalog.items_in(&section.id).cloned().collect();
            let mut states = match extractor.extract_section(&user, section, &items).await {
                Ok(states) => states,
                Err(e) => {
                    warn!("Cannot read '{}' for '{}': {}", section.title, name, e);
                    report.fail(
                        FailureKind::ExtractFailure,
                        Some(name.as_str()),
                        Some(section.title.as_str()),
                        e.to_string(),
                    );
                    for _ in &items {
                        tracker.record_failed("section unreadable");
                        self.observer.record_done(&name);
                    }
                    continue;
                }
            };

            for item in &items {
                if self.cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'sections;
                }
                match states.remove(&item.rating_key) {
                    Some(Ok(state)) if self.options.include_unwatched || state.has_activity() => {
                        records.push(SnapshotRecord::from_item(&name, Some(section.title.clone()), item, state));
                        report.records_exported += 1;
                        tracker.record_applied();
                    }
                    Some(Ok(_)) => {
                        report.records_skipped += 1;
                        tracker.record_skipped();
                    }
                    Some(Err(e)) => {
                        report.fail(
                            FailureKind::ExtractFailure,
                            Some(name.as_str()),
                            Some(item.describe().as_str()),
                            e.to_string(),
                        );
                        tracker.record_failed(&e.to_string());
                    }
                    None => {
                        report.records_skipped += 1;
                        tracker.record_skipped();
                    }
                }
                self.observer.record_done(&name);
                tracker.log_progress();
            }
        }

        report.users_processed = 1;
        tracker.log_summary();
        self.observer.user_finished(&name, &report);
        (records, report)
    }

    /// Apply a snapshot to `destination`.
    #[instrument(skip_all, fields(server = %destination.label()))]
    pub async fn import(&self, destination: &dyn MediaServer, snapshot: Snapshot) -> Result<RunReport, SyncError> {
        let start = Instant::now();
        let mut report = RunReport::new(RunMode::Import);
        report.dry_run = self.options.dry_run;
        self.enter(&mut report, RunPhase::Init);
        self.check_options().map_err(|e| self.abort(e))?;

        let resolver = self.resolver();
        // Destination sections are named independently of the source's, so
        // every section is indexed and the filter applies to the records.
        let catalog = self
            .index(
                destination,
                &resolver,
                &mut report,
                &SectionFilter::all(),
                &UserFilter::all(),
            )
            .await
            .map_err(|e| self.abort(e))?;

        let user_filter = UserFilter::new(&self.options.users);
        let section_filter = SectionFilter::new(self.options.sections.clone());
        let mut by_user: BTreeMap<String, (String, Vec<SnapshotRecord>)> = BTreeMap::new();
        for record in snapshot.records {
            let in_sections = section_filter.is_all()
                || record
                    .section
                    .as_deref()
                    .map_or(false, |title| section_filter.matches_title(title));
            if !user_filter.matches_name(&record.user) || !in_sections {
                report.records_skipped += 1;
                continue;
            }
            by_user
                .entry(normalize_username(&record.user))
                .or_insert_with(|| (record.user.clone(), Vec::new()))
                .1
                .push(record);
        }

        self.enter(&mut report, RunPhase::Applying);
        self.observer.users_planned(by_user.len());
        info!(
            operation = "import",
            users = by_user.len(),
            workers = self.options.workers,
            dry_run = self.options.dry_run,
            "Importing watch state of {} users",
            by_user.len()
        );

        let partials: Vec<RunReport> = stream::iter(by_user.into_values())
            .map(|(name, records)| self.import_user(destination, &catalog, &resolver, name, records))
            .buffer_unordered(self.options.workers)
            .collect()
            .await;

        self.enter(&mut report, RunPhase::Merging);
        for partial in partials {
            report.absorb(partial);
        }
        self.flush_cache().await;

        report.finish(start.elapsed());
        self.observer.phase_changed(report.phase);
        info!(
            operation = "import",
            status = %report.phase,
            "Import finished: {} applied, {} unchanged, {} failed, {} unmatched in {:.1}s",
            report.states_applied,
            report.states_unchanged,
            report.states_failed,
            report.items_unmatched,
            report.duration.as_secs_f64()
        );
        Ok(report)
    }

    /// Read the snapshot at `path` and `import` it.
    pub async fn import_from_file(&self, destination: &dyn MediaServer, path: &Path) -> Result<RunReport, SyncError> {
        let snapshot = Snapshot::read(path).await.map_err(|e| self.abort(e))?;
        self.import(destination, snapshot).await
    }

    async fn import_user(
        &self,
        destination: &dyn MediaServer,
        catalog: &Catalog,
        resolver: &IdentityResolver,
        name: String,
        records: Vec<SnapshotRecord>,
    ) -> RunReport {
        let mut report = RunReport::new(RunMode::Import);
        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        let Some(user) = find_user(catalog.users(), &name) else {
            warn!("User '{}' not found on the {} server, skipping", name, destination.label());
            report.users_skipped = 1;
            report.fail(
                FailureKind::UserNotFound,
                Some(name.as_str()),
                None,
                format!("no user named '{}' on the {} server", name, destination.label()),
            );
            return report;
        };

        self.observer.user_started(&name, records.len());
        let mut tracker = ProgressTracker::new(format!("Import for '{}'", name), records.len(), PROGRESS_INTERVAL);
        let applier = StateApplier::new(destination, self.options.dry_run);

        for record in &records {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let item = record.to_item();
            let targets = match catalog.lookup(resolver, &item, user) {
                Lookup::Identified(copies) => copies,
                Lookup::Matched(target) => vec![target],
                Lookup::Ambiguous { chosen, candidates } => {
                    warn!(
                        "Ambiguous match for {} ({} candidates), using {}",
                        item.describe(),
                        candidates,
                        chosen.rating_key
                    );
                    report.ambiguous_matches += 1;
                    report.warn(
                        WarningKind::MatchAmbiguous,
                        Some(name.as_str()),
                        Some(item.describe().as_str()),
                        format!("{} candidates, applied to item {} only", candidates, chosen.rating_key),
                    );
                    vec![chosen]
                }
                Lookup::Unmatched => {
                    debug!("No destination item for {} ({})", item.describe(), name);
                    report.items_unmatched += 1;
                    tracker.record_skipped();
                    self.observer.record_done(&name);
                    tracker.log_progress();
                    continue;
                }
            };

            report.items_matched += 1;
            if targets.len() > 1 {
                debug!("{} has {} copies on the destination, applying to each", item.describe(), targets.len());
            }
            // One outcome per record: any failed copy fails it, any changed copy counts as applied
            let mut applied = false;
            let mut failed = Vec::new();
            for target in &targets {
                match applier.apply(user, target, &record.state).await {
                    ApplyOutcome::Applied(_) => applied = true,
                    ApplyOutcome::Unchanged => {}
                    ApplyOutcome::Failed(message) => {
                        warn!("Failed to apply {} for '{}': {}", target.describe(), name, message);
                        failed.push((target.describe(), message));
                    }
                }
            }
            if !failed.is_empty() {
                report.states_failed += 1;
                for (target, message) in failed {
                    report.fail(FailureKind::ApplyFailure, Some(name.as_str()), Some(target.as_str()), message);
                }
                tracker.record_failed("apply rejected");
            } else if applied {
                report.states_applied += 1;
                tracker.record_applied();
            } else {
                report.states_unchanged += 1;
                tracker.record_unchanged();
            }
            self.observer.record_done(&name);
            tracker.log_progress();
        }

        report.users_processed = 1;
        tracker.log_summary();
        self.observer.user_finished(&name, &report);
        report
    }
}
