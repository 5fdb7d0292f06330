pub mod sync;
pub mod apply;
pub mod cache;
pub mod cache_storage;
pub mod catalog;
pub mod error;
pub mod extract;
pub mod identity;
pub mod progress;
pub mod report;
pub mod snapshot;
pub mod users;

pub use sync::{NoopObserver, RunObserver, SyncOptions, SyncOrchestrator};
pub use apply::{plan_changes, ApplyAction, ApplyOutcome, StateApplier};
pub use cache::{open_cache, CacheStats, CacheStore, DiskCache, DisabledCache};
pub use catalog::{Catalog, CatalogIndexer, Lookup, SectionFilter};
pub use error::SyncError;
pub use extract::StateExtractor;
pub use identity::{normalize_title, FallbackKey, IdentityResolver, MatchKey};
pub use report::{Failure, FailureKind, RunMode, RunPhase, RunReport, Warning, WarningKind};
pub use snapshot::{merge_records, Snapshot, SNAPSHOT_VERSION};
pub use users::{find_user, select_users, UserFilter};
