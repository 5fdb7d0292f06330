pub mod api;
pub mod client;
pub mod metadata;

pub use client::PlexServer;
pub use metadata::PlexGuidConverter;
