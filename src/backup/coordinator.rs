//! Backup coordinator: owns the backup lock, the pending-write counter, and
//! the push sequence.
//!
//! One mutex guards the store connection, the counter, and any in-flight
//! push. Request threads and the periodic timer both funnel through it, so
//! at most one push is ever in flight and a snapshot encode never observes a
//! writer mid-transaction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backup::pointer;
use crate::backup::policy::{BackupCounterState, TriggerDecision, TriggerPolicy, WriteEvent};
use crate::backup::remote::{RemoteBlobRef, RemoteRepo};
use crate::backup::snapshot;
use crate::config::Config;
use crate::error::{BotforgeError, Result};
use crate::storage::Database;

/// Result of a manual push request.
#[derive(Debug)]
pub enum PushOutcome {
    Completed(RemoteBlobRef),
    Failed { error: BotforgeError },
}

impl PushOutcome {
    pub fn ok(&self) -> bool {
        matches!(self, PushOutcome::Completed(_))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BackupStats {
    pub push_count: u64,
    pub last_push_at: Option<DateTime<Utc>>,
    pub pending_count: u32,
}

struct Inner {
    db: Database,
    counter: BackupCounterState,
    push_count: u64,
}

pub struct BackupCoordinator {
    inner: Mutex<Inner>,
    repo: RemoteRepo,
    backup_prefix: String,
    store_path: PathBuf,
    store_name: String,
    policy: TriggerPolicy,
    interval: Duration,
}

impl BackupCoordinator {
    pub fn new(db: Database, repo: RemoteRepo, config: &Config) -> Self {
        let store_path = config.store.db_path.clone();
        let store_name = store_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "botforge".to_string());
        Self {
            inner: Mutex::new(Inner {
                db,
                counter: BackupCounterState::default(),
                push_count: 0,
            }),
            repo,
            backup_prefix: config.github.backup_path.trim_end_matches('/').to_string(),
            store_path,
            store_name,
            policy: TriggerPolicy::new(config.backup.threshold),
            interval: Duration::from_secs(config.backup.interval_secs),
        }
    }

    /// Run a closure against the store under the backup lock.
    pub fn with_store<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock();
        f(&inner.db)
    }

    /// Account for one local write and push synchronously when the policy
    /// says so. Push failures are logged and swallowed: the counter stays
    /// unreduced, so the same unpushed events retrigger at the next event or
    /// sweep. Ignored entirely while `auto_backup_enabled` is off.
    pub fn record_write(&self, event: WriteEvent) {
        let mut inner = self.inner.lock();
        if !Self::auto_backup_enabled(&inner.db) {
            debug!(kind = event.kind.as_str(), "automatic backups disabled, write not counted");
            return;
        }
        let policy = self.effective_policy(&inner.db);
        let decision = policy.evaluate(&event, &mut inner.counter);
        if decision != TriggerDecision::PushNow {
            return;
        }

        let reason = format!("auto_{}", event.kind.as_str());
        if let Err(err) = self.push_locked(&mut inner, &reason) {
            warn!(reason, pending = inner.counter.pending_count, "push failed: {err}");
        }
    }

    /// Manually-requested push; reports a one-line reason on failure.
    pub fn force_push(&self, reason: &str) -> PushOutcome {
        let mut inner = self.inner.lock();
        match self.push_locked(&mut inner, reason) {
            Ok(blob) => PushOutcome::Completed(blob),
            Err(error) => PushOutcome::Failed { error },
        }
    }

    /// Periodic sweep entry point; pushes only when writes are pending and
    /// automatic backups are enabled. Returns true when a push completed.
    pub fn maybe_push(&self, trigger: &str) -> bool {
        let mut inner = self.inner.lock();
        if !Self::auto_backup_enabled(&inner.db) {
            return false;
        }
        if self.policy.evaluate_sweep(&inner.counter) != TriggerDecision::PushNow {
            return false;
        }
        match self.push_locked(&mut inner, trigger) {
            Ok(_) => true,
            Err(err) => {
                warn!(trigger, pending = inner.counter.pending_count, "push failed: {err}");
                false
            }
        }
    }

    /// The `auto_backup_enabled` setting gates every automatic trigger;
    /// manual pushes bypass it. Absent or unreadable means enabled.
    fn auto_backup_enabled(db: &Database) -> bool {
        match db.get_setting("auto_backup_enabled") {
            Ok(Some(value)) => value != "0",
            _ => true,
        }
    }

    /// Threshold comes from the `backup_interval` setting when it parses,
    /// falling back to the configured value.
    fn effective_policy(&self, db: &Database) -> TriggerPolicy {
        let threshold = db
            .get_setting("backup_interval")
            .ok()
            .flatten()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(self.policy.threshold);
        TriggerPolicy::new(threshold)
    }

    pub fn stats(&self) -> BackupStats {
        let inner = self.inner.lock();
        BackupStats {
            push_count: inner.push_count,
            last_push_at: inner.counter.last_push_at,
            pending_count: inner.counter.pending_count,
        }
    }

    /// Spawn the long-lived timer thread for periodic sweeps.
    pub fn spawn_periodic(coordinator: Arc<Self>) -> std::thread::JoinHandle<()> {
        let interval = coordinator.interval;
        std::thread::Builder::new()
            .name("backup-timer".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                if coordinator.maybe_push("periodic") {
                    debug!("periodic push completed");
                }
            })
            .expect("spawn backup timer thread")
    }

    /// The single push call site. Lock held throughout: encode, blob put,
    /// pointer update, counter reset. Counter is reset only here, only after
    /// the blob push succeeded.
    fn push_locked(&self, inner: &mut Inner, reason: &str) -> Result<RemoteBlobRef> {
        let snap = snapshot::encode(&self.store_path)?;
        let stamp = snap.produced_at.format("%Y%m%d_%H%M%S");
        let filename = format!("{}_{stamp}.db", self.store_name);
        let path = format!("{}/{filename}", self.backup_prefix);
        let message = format!("Backup: {reason} - {stamp}");

        let blob = self
            .repo
            .put(&path, &snap.payload, &message, None)
            .map_err(BotforgeError::Remote)?;

        // Pointer write happens strictly after the blob is acknowledged. A
        // failure here is tolerated: list-based discovery covers recovery.
        if let Err(err) = pointer::write(
            &self.repo,
            &self.backup_prefix,
            &filename,
            &blob.version_token,
        ) {
            warn!(filename, "pointer update failed: {err}");
        }

        inner.counter.pending_count = 0;
        inner.counter.last_push_at = Some(Utc::now());
        inner.push_count += 1;
        debug!(
            filename,
            size = snap.size_bytes,
            digest = %snap.digest(),
            reason,
            "snapshot pushed"
        );
        Ok(blob)
    }
}

impl std::fmt::Debug for BackupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCoordinator")
            .field("backup_prefix", &self.backup_prefix)
            .field("store_name", &self.store_name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
