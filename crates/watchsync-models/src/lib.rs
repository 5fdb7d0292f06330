pub mod agent;
pub mod identifier;
pub mod media;
pub mod section;
pub mod snapshot;
pub mod user;
pub mod watch_state;

pub use agent::AgentMode;
pub use identifier::{Identifier, Namespace};
pub use media::{MediaItem, MediaKind};
pub use section::Section;
pub use snapshot::SnapshotRecord;
pub use user::{normalize_username, ServerUser};
pub use watch_state::{is_valid_rating, WatchState, MAX_RATING};
