use std::io;

use thiserror::Error;

use crate::backup::remote::RemoteError;

#[derive(Error, Debug)]
pub enum BotforgeError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote repository error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Missing required config: {0}")]
    MissingConfig(String),

    #[error("Telegram error: {0}")]
    Telegram(String),
}

pub type Result<T> = std::result::Result<T, BotforgeError>;
