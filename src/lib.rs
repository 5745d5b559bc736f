pub mod backup;
pub mod bot;
pub mod cli;
pub mod config;
pub mod error;
pub mod storage;

pub use error::{BotforgeError, Result};

/// Package version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
