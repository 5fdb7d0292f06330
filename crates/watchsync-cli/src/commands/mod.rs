pub mod clear;
pub mod config;
pub mod sync;
pub mod sync_ui;
pub mod users;
