//! Startup recovery: restore the latest snapshot or bootstrap a fresh store.
//!
//! Runs exactly once per process lifetime, before any write traffic. Every
//! failure demotes to the fallback branch instead of aborting: service
//! availability outranks any single snapshot's durability.

use std::path::Path;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::backup::pointer;
use crate::backup::remote::{RemoteBlobRef, RemoteRepo};
use crate::backup::snapshot::{self, SnapshotFormat};
use crate::error::Result;
use crate::storage::{migrations, Database};

/// Which snapshot generation was restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SnapshotKind {
    Native,
    LegacyExport,
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Native => write!(f, "native"),
            SnapshotKind::LegacyExport => write!(f, "legacy-export"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub recovered: bool,
    pub format: Option<SnapshotKind>,
    pub blob_ref: Option<RemoteBlobRef>,
}

impl RecoveryOutcome {
    fn fallback() -> Self {
        Self {
            recovered: false,
            format: None,
            blob_ref: None,
        }
    }
}

/// Protocol stages, for logging. `Fallback` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Probing,
    Restoring,
    Verifying,
    Ready,
    Fallback,
}

/// Restore the newest remote snapshot into `db_path`, or initialize a fresh
/// schema-complete store. Never fails for remote or decode reasons; only a
/// local disk failure while building the fallback store is an error.
pub fn recover_on_startup(
    repo: &RemoteRepo,
    backup_prefix: &str,
    db_path: &Path,
) -> Result<RecoveryOutcome> {
    let mut stage = Stage::Probing;

    let outcome = match try_restore(repo, backup_prefix, db_path, &mut stage) {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            info!("no remote snapshot found, starting fresh");
            RecoveryOutcome::fallback()
        }
        Err(reason) => {
            warn!(?stage, "recovery demoted to fallback: {reason}");
            RecoveryOutcome::fallback()
        }
    };

    if !outcome.recovered {
        initialize_fresh(db_path)?;
    }
    Ok(outcome)
}

/// The happy path of the state machine. `Ok(None)` means there is nothing to
/// restore; `Err` carries the demotion reason.
fn try_restore(
    repo: &RemoteRepo,
    backup_prefix: &str,
    db_path: &Path,
    stage: &mut Stage,
) -> std::result::Result<Option<RecoveryOutcome>, String> {
    *stage = Stage::Probing;
    let snapshot_name = match pointer::read(repo, backup_prefix)
        .map_err(|err| format!("pointer read: {err}"))?
    {
        Some(pointer) => {
            info!(snapshot = %pointer.snapshot_path, "latest pointer found");
            pointer.snapshot_path
        }
        None => {
            // Timestamped filenames make lexical order chronological.
            let entries = repo
                .list(backup_prefix)
                .map_err(|err| format!("list {backup_prefix}: {err}"))?;
            let newest = entries
                .into_iter()
                .filter(|entry| entry.name.ends_with(".db"))
                .map(|entry| entry.name)
                .max();
            match newest {
                Some(name) => {
                    info!(snapshot = %name, "pointer absent, discovered via listing");
                    name
                }
                None => return Ok(None),
            }
        }
    };

    *stage = Stage::Restoring;
    let blob_path = format!("{}/{snapshot_name}", backup_prefix.trim_end_matches('/'));
    let (bytes, version_token) = repo
        .get(&blob_path)
        .map_err(|err| format!("fetch {blob_path}: {err}"))?;

    *stage = Stage::Verifying;
    let format = match snapshot::classify(&bytes) {
        Some(SnapshotFormat::Native(image)) => {
            snapshot::install_native(&image, db_path)
                .map_err(|err| format!("install native: {err}"))?;
            SnapshotKind::Native
        }
        Some(SnapshotFormat::LegacyExport(tables)) => {
            install_legacy_store(db_path, &tables)
                .map_err(|err| format!("install legacy export: {err}"))?;
            SnapshotKind::LegacyExport
        }
        None => return Err(format!("unrecognized snapshot format in {blob_path}")),
    };

    verify_store(db_path).map_err(|err| format!("verify restored store: {err}"))?;

    *stage = Stage::Ready;
    info!(snapshot = %snapshot_name, %format, "store recovered");
    Ok(Some(RecoveryOutcome {
        recovered: true,
        format: Some(format),
        blob_ref: Some(RemoteBlobRef {
            path: blob_path,
            version_token,
            branch: repo.branch().to_string(),
        }),
    }))
}

fn install_legacy_store(
    db_path: &Path,
    tables: &std::collections::BTreeMap<String, snapshot::LegacyTable>,
) -> Result<()> {
    // Legacy reconstruction starts from an empty file.
    if db_path.exists() {
        std::fs::remove_file(db_path)?;
    }
    let conn = Connection::open(db_path)?;
    snapshot::install_legacy(&conn, tables)
}

/// Confirm the fixed required table set on the restored file, before any
/// migration has a chance to paper over gaps.
fn verify_store(db_path: &Path) -> std::result::Result<(), String> {
    let conn = Connection::open(db_path).map_err(|err| err.to_string())?;
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table'")
        .map_err(|err| err.to_string())?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|err| err.to_string())?
        .filter_map(|name| name.ok())
        .collect();

    let missing: Vec<&str> = migrations::REQUIRED_TABLES
        .iter()
        .filter(|required| !existing.iter().any(|table| table == *required))
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing tables: {missing:?}"))
    }
}

/// Fallback branch: a fresh, schema-complete, empty store.
fn initialize_fresh(db_path: &Path) -> Result<()> {
    if db_path.exists() {
        std::fs::remove_file(db_path)?;
    }
    let db = Database::open(db_path)?;
    drop(db);
    Ok(())
}
