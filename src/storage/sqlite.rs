//! SQLite database layer

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::migrations;

/// SQLite database wrapper for the bot-factory state.
///
/// One shared connection; concurrent readers are safe, writers hold the
/// backup lock so a snapshot encode never observes mid-write bytes.
pub struct Database {
    conn: Connection,
    schema_version: u32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub stars_balance: i64,
    pub created_at: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub user_id: i64,
    pub stars_amount: i64,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotRecord {
    pub bot_token: String,
    pub bot_username: Option<String>,
    pub owner_id: i64,
    pub stars_paid: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub users: i64,
    pub payments: i64,
    pub bots: i64,
}

impl Database {
    /// Open database at the given path, running migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure_pragmas(&conn)?;
        let schema_version = migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            schema_version,
        })
    }

    /// Open without touching the filesystem; tests use this.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let schema_version = migrations::run_migrations(&conn)?;
        Ok(Self {
            conn,
            schema_version,
        })
    }

    fn configure_pragmas(conn: &Connection) -> Result<()> {
        // TRUNCATE journal keeps the main file self-contained so a verbatim
        // byte copy of it is a complete snapshot.
        conn.execute_batch(
            "PRAGMA journal_mode = TRUNCATE;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Get a reference to the connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Current schema version after migrations.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Names of all user tables.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    /// True if every table in `required` exists.
    pub fn has_tables(&self, required: &[&str]) -> Result<bool> {
        let existing = self.table_names()?;
        Ok(required.iter().all(|t| existing.iter().any(|e| e == t)))
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>> {
        self.conn
            .query_row(
                "SELECT user_id, username, first_name, stars_balance, created_at, last_seen \
                 FROM users WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(UserRecord {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        first_name: row.get(2)?,
                        stars_balance: row.get(3)?,
                        created_at: row.get(4)?,
                        last_seen: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert or refresh a user row. Returns true when the row was newly
    /// created (first registration).
    pub fn upsert_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
    ) -> Result<bool> {
        let existing = self.get_user(user_id)?;
        if existing.is_some() {
            self.conn.execute(
                "UPDATE users SET username = COALESCE(?2, username), \
                 first_name = COALESCE(?3, first_name), last_seen = ?4 WHERE user_id = ?1",
                params![user_id, username, first_name, Utc::now().to_rfc3339()],
            )?;
            Ok(false)
        } else {
            self.conn.execute(
                "INSERT INTO users (user_id, username, first_name) VALUES (?1, ?2, ?3)",
                params![user_id, username, first_name],
            )?;
            Ok(true)
        }
    }

    pub fn credit_stars(&self, user_id: i64, amount: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE users SET stars_balance = stars_balance + ?2 WHERE user_id = ?1",
            params![user_id, amount],
        )?;
        Ok(())
    }

    pub fn debit_stars(&self, user_id: i64, amount: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET stars_balance = stars_balance - ?2 \
             WHERE user_id = ?1 AND stars_balance >= ?2",
            params![user_id, amount],
        )?;
        Ok(changed > 0)
    }

    /// Create a pending payment and return its id.
    pub fn record_payment(&self, user_id: i64, stars_amount: i64) -> Result<String> {
        let payment_id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO star_payments (payment_id, user_id, stars_amount) VALUES (?1, ?2, ?3)",
            params![payment_id, user_id, stars_amount],
        )?;
        Ok(payment_id)
    }

    /// Mark a pending payment verified and credit the stars. Returns the
    /// settled payment, or None when the id is unknown or already settled.
    pub fn settle_payment(
        &self,
        payment_id: &str,
        verified_by: i64,
    ) -> Result<Option<PaymentRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT payment_id, user_id, stars_amount, status, created_at \
                 FROM star_payments WHERE payment_id = ?1 AND status = 'pending'",
                [payment_id],
                |row| {
                    Ok(PaymentRecord {
                        payment_id: row.get(0)?,
                        user_id: row.get(1)?,
                        stars_amount: row.get(2)?,
                        status: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        let Some(record) = record else {
            return Ok(None);
        };

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE star_payments SET status = 'verified', verified_at = ?2, verified_by = ?3 \
             WHERE payment_id = ?1",
            params![payment_id, Utc::now().to_rfc3339(), verified_by],
        )?;
        tx.execute(
            "UPDATE users SET stars_balance = stars_balance + ?2 WHERE user_id = ?1",
            params![record.user_id, record.stars_amount],
        )?;
        tx.commit()?;

        Ok(Some(PaymentRecord {
            status: "verified".to_string(),
            ..record
        }))
    }

    pub fn register_bot(
        &self,
        bot_token: &str,
        bot_username: Option<&str>,
        owner_id: i64,
        stars_paid: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_bots (bot_token, bot_username, owner_id, stars_paid) \
             VALUES (?1, ?2, ?3, ?4)",
            params![bot_token, bot_username, owner_id, stars_paid],
        )?;
        Ok(())
    }

    pub fn list_bots_for(&self, owner_id: i64) -> Result<Vec<BotRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT bot_token, bot_username, owner_id, stars_paid, is_active \
             FROM user_bots WHERE owner_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([owner_id], |row| {
            Ok(BotRecord {
                bot_token: row.get(0)?,
                bot_username: row.get(1)?,
                owner_id: row.get(2)?,
                stars_paid: row.get(3)?,
                is_active: row.get::<_, i64>(4)? != 0,
            })
        })?;
        let mut bots = Vec::new();
        for bot in rows {
            bots.push(bot?);
        }
        Ok(bots)
    }

    pub fn log_activity(&self, user_id: Option<i64>, action: &str, details: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO activity_logs (user_id, action, details) VALUES (?1, ?2, ?3)",
            params![user_id, action, details],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT setting_value FROM system_settings WHERE setting_key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO system_settings (setting_key, setting_value, updated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(setting_key) DO UPDATE SET setting_value = ?2, updated_at = ?3",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let users = self
            .conn
            .query_row("SELECT count(*) FROM users", [], |row| row.get(0))?;
        let payments = self
            .conn
            .query_row("SELECT count(*) FROM star_payments", [], |row| row.get(0))?;
        let bots = self
            .conn
            .query_row("SELECT count(*) FROM user_bots", [], |row| row.get(0))?;
        Ok(StoreCounts {
            users,
            payments,
            bots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_user_reports_first_registration() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.upsert_user(1, Some("alice"), Some("Alice")).unwrap());
        assert!(!db.upsert_user(1, Some("alice"), None).unwrap());

        let user = db.get_user(1).unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert_eq!(user.first_name.as_deref(), Some("Alice"));
        assert_eq!(user.stars_balance, 0);
    }

    #[test]
    fn settle_payment_credits_balance_once() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(7, Some("bob"), None).unwrap();
        let payment_id = db.record_payment(7, 200).unwrap();

        let settled = db.settle_payment(&payment_id, 99).unwrap().unwrap();
        assert_eq!(settled.status, "verified");
        assert_eq!(db.get_user(7).unwrap().unwrap().stars_balance, 200);

        // Already settled: no double credit.
        assert!(db.settle_payment(&payment_id, 99).unwrap().is_none());
        assert_eq!(db.get_user(7).unwrap().unwrap().stars_balance, 200);
    }

    #[test]
    fn settle_payment_unknown_id_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.settle_payment("nope", 1).unwrap().is_none());
    }

    #[test]
    fn debit_stars_requires_sufficient_balance() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(3, None, None).unwrap();
        db.credit_stars(3, 100).unwrap();

        assert!(!db.debit_stars(3, 200).unwrap());
        assert!(db.debit_stars(3, 100).unwrap());
        assert_eq!(db.get_user(3).unwrap().unwrap().stars_balance, 0);
    }

    #[test]
    fn register_and_list_bots() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_user(5, None, None).unwrap();
        db.register_bot("123:abc", Some("mybot"), 5, 200).unwrap();
        db.register_bot("456:def", None, 5, 200).unwrap();

        let bots = db.list_bots_for(5).unwrap();
        assert_eq!(bots.len(), 2);
        assert!(bots[0].is_active);
        assert_eq!(bots[0].bot_username.as_deref(), Some("mybot"));
    }

    #[test]
    fn has_tables_checks_required_set() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.has_tables(&migrations::REQUIRED_TABLES).unwrap());
        assert!(!db.has_tables(&["users", "no_such_table"]).unwrap());
    }

    #[test]
    fn settings_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_setting("star_price").unwrap().as_deref(), Some("200"));
        db.set_setting("star_price", "150").unwrap();
        assert_eq!(db.get_setting("star_price").unwrap().as_deref(), Some("150"));
        assert!(db.get_setting("missing").unwrap().is_none());
    }
}
