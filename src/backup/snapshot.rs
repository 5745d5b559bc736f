//! Snapshot codec: encode the local store and validate/install received
//! snapshots.
//!
//! Two generations of snapshot exist on the remote tier: the native SQLite
//! file image, and a legacy JSON table export (`{"tables": {...}}`). Both
//! must restore; unrecognized bytes are a decode failure, never a crash.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BotforgeError, Result};

/// SQLite file header magic.
const NATIVE_SIGNATURE: &[u8] = b"SQLite format 3\0";

/// A complete, independently restorable copy of the store at one instant.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub payload: Vec<u8>,
    pub produced_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl StoreSnapshot {
    /// Hex sha256 of the payload, for logs and stats.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.payload))
    }
}

/// One table in the legacy export: schema DDL plus rows in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyTable {
    pub schema: String,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct LegacyExportDoc {
    tables: BTreeMap<String, LegacyTable>,
}

/// Decoded snapshot, dispatched by pattern match rather than re-sniffing.
#[derive(Debug, Clone)]
pub enum SnapshotFormat {
    Native(Vec<u8>),
    LegacyExport(BTreeMap<String, LegacyTable>),
}

/// Verbatim byte copy of the store file. The caller must hold the backup
/// lock so no writer is mid-transaction.
pub fn encode(store_path: &Path) -> Result<StoreSnapshot> {
    let payload = std::fs::read(store_path)?;
    let size_bytes = payload.len() as u64;
    Ok(StoreSnapshot {
        payload,
        produced_at: Utc::now(),
        size_bytes,
    })
}

/// Classify raw snapshot bytes. None means neither generation matched.
pub fn classify(bytes: &[u8]) -> Option<SnapshotFormat> {
    if bytes.starts_with(NATIVE_SIGNATURE) {
        return Some(SnapshotFormat::Native(bytes.to_vec()));
    }
    if let Ok(doc) = serde_json::from_slice::<LegacyExportDoc>(bytes) {
        return Some(SnapshotFormat::LegacyExport(doc.tables));
    }
    None
}

/// Raw overwrite of the local store file with a native snapshot image.
pub fn install_native(bytes: &[u8], store_path: &Path) -> Result<()> {
    if let Some(parent) = store_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(store_path, bytes)?;
    Ok(())
}

/// Rebuild tables from a legacy export inside one transaction: every table
/// installed or none.
pub fn install_legacy(
    conn: &Connection,
    tables: &BTreeMap<String, LegacyTable>,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for (name, table) in tables {
        validate_table_name(name)?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\""))?;
        tx.execute_batch(&table.schema)?;
        for row in &table.rows {
            let placeholders = (1..=row.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("INSERT INTO \"{name}\" VALUES ({placeholders})");
            let params: Vec<Box<dyn rusqlite::ToSql>> =
                row.iter().map(|value| json_to_sql(value)).collect();
            tx.execute(
                &sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn validate_table_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(BotforgeError::Snapshot(format!(
            "invalid table name in legacy export: {name:?}"
        )))
    }
}

fn json_to_sql(value: &serde_json::Value) -> Box<dyn rusqlite::ToSql> {
    match value {
        serde_json::Value::Null => Box::new(rusqlite::types::Null),
        serde_json::Value::Bool(b) => Box::new(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else {
                Box::new(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}
