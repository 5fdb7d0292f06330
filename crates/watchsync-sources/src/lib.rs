pub mod error;
pub mod factory;
pub mod memory;
pub mod plex;
pub mod traits;

pub use error::SourceError;
pub use factory::{create_converter, create_server};
pub use memory::InMemoryServer;
pub use plex::{PlexGuidConverter, PlexServer};
pub use traits::{GuidConverter, MediaServer, ServerInfo};
