//! Embedded SQLite store: schema migrations and the thin data-access layer
//! the command dispatch uses.

pub mod migrations;
pub mod sqlite;

pub use sqlite::Database;
