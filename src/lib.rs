// Public API for integration tests and potential library usage

pub mod config;
pub mod history;
pub mod identity;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod text;
pub mod throttle;
pub mod types;
pub mod ws;
