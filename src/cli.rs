//! Command-line interface: argument parsing and the service entry points.
//!
//! Uses clap v4 with derive macros for argument parsing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::backup::{recovery, BackupCoordinator, PushOutcome, RemoteRepo};
use crate::backup::pointer;
use crate::bot::commands::{self, Dispatcher};
use crate::bot::TelegramClient;
use crate::config::Config;
use crate::error::Result;
use crate::storage::Database;

/// Bot factory service with GitHub-backed state replication
#[derive(Parser, Debug)]
#[command(name = "botforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file path (default: ./config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bot: recover state, then serve updates
    Serve,

    /// Push one snapshot now and exit
    Backup {
        /// Reason recorded in the snapshot commit message
        #[arg(long, default_value = "manual")]
        reason: String,
    },

    /// Restore the local store from the newest remote snapshot and exit
    Restore,

    /// Show local store counts and the remote pointer
    Status,
}

pub fn run(cli: &Cli) -> Result<()> {
    let config = Config::load_checked(cli.config.as_deref())?;
    match &cli.command {
        Commands::Serve => serve(&config),
        Commands::Backup { reason } => backup(&config, reason),
        Commands::Restore => restore(&config),
        Commands::Status => status(&config),
    }
}

fn http_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.backup.http_timeout_secs)
}

/// The full service wiring: recovery runs to completion before the first
/// update is accepted, so every handler sees a verified (or fresh) store.
fn serve(config: &Config) -> Result<()> {
    let repo = RemoteRepo::from_config(&config.github, http_timeout(config));
    let outcome = recovery::recover_on_startup(
        &repo,
        &config.github.backup_path,
        &config.store.db_path,
    )?;

    let db = Database::open(&config.store.db_path)?;
    let coordinator = Arc::new(BackupCoordinator::new(db, repo, config));

    if outcome.recovered {
        info!(format = ?outcome.format, "state recovered from remote snapshot");
    } else {
        // Fresh store: seed the remote immediately so the next cold start
        // has something to recover from.
        match coordinator.force_push("initial") {
            PushOutcome::Completed(blob) => info!(path = blob.path, "initial snapshot pushed"),
            PushOutcome::Failed { error } => warn!("initial snapshot push failed: {error}"),
        }
    }

    let _timer = BackupCoordinator::spawn_periodic(Arc::clone(&coordinator));

    let telegram = Arc::new(TelegramClient::new(&config.telegram, http_timeout(config)));
    notify_admins(&telegram, config, &outcome);

    info!(version = crate::VERSION, "botforge serving updates");
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&telegram),
        coordinator,
        config,
    ));
    commands::run_loop(dispatcher, telegram)
}

/// Startup notification; delivery failures are logged, never fatal.
fn notify_admins(telegram: &TelegramClient, config: &Config, outcome: &recovery::RecoveryOutcome) {
    let text = if outcome.recovered {
        format!(
            "botforge {} started; state recovered from {}.",
            crate::VERSION,
            outcome
                .blob_ref
                .as_ref()
                .map(|blob| blob.path.as_str())
                .unwrap_or("remote snapshot")
        )
    } else {
        format!("botforge {} started with a fresh store.", crate::VERSION)
    };
    for admin_id in &config.telegram.admin_ids {
        if let Err(err) = telegram.send_message(*admin_id, &text) {
            warn!(admin_id, "startup notification failed: {err}");
        }
    }
}

fn backup(config: &Config, reason: &str) -> Result<()> {
    let repo = RemoteRepo::from_config(&config.github, http_timeout(config));
    let db = Database::open(&config.store.db_path)?;
    let coordinator = BackupCoordinator::new(db, repo, config);

    match coordinator.force_push(reason) {
        PushOutcome::Completed(blob) => {
            println!("pushed {} ({})", blob.path, blob.version_token);
            Ok(())
        }
        PushOutcome::Failed { error } => Err(error),
    }
}

fn restore(config: &Config) -> Result<()> {
    let repo = RemoteRepo::from_config(&config.github, http_timeout(config));
    let outcome = recovery::recover_on_startup(
        &repo,
        &config.github.backup_path,
        &config.store.db_path,
    )?;

    if outcome.recovered {
        let format = outcome
            .format
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "restored {} from {}",
            format,
            outcome
                .blob_ref
                .as_ref()
                .map(|blob| blob.path.as_str())
                .unwrap_or("remote")
        );
        return Ok(());
    }

    // Same seed push serve performs after a fallback, so the remote tier
    // does not stay pointer-less.
    let db = Database::open(&config.store.db_path)?;
    let coordinator = BackupCoordinator::new(db, repo, config);
    match coordinator.force_push("initial") {
        PushOutcome::Completed(blob) => println!(
            "no usable remote snapshot; initialized a fresh store and pushed {}",
            blob.path
        ),
        PushOutcome::Failed { error } => println!(
            "no usable remote snapshot; initialized a fresh store (initial push failed: {error})"
        ),
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let db = Database::open(&config.store.db_path)?;
    let counts = db.counts()?;
    println!(
        "local store: {} users, {} payments, {} bots (schema v{})",
        counts.users,
        counts.payments,
        counts.bots,
        db.schema_version()
    );

    let repo = RemoteRepo::from_config(&config.github, http_timeout(config));
    match pointer::read(&repo, &config.github.backup_path) {
        Ok(Some(ptr)) => println!(
            "remote pointer: {} ({}) written {}",
            ptr.snapshot_path,
            ptr.version_token,
            ptr.written_at.to_rfc3339()
        ),
        Ok(None) => println!("remote pointer: none"),
        Err(err) => println!("remote pointer: unreachable ({err})"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::RemoteError;
    use crate::error::BotforgeError;
    use httpmock::prelude::*;
    use serde_json::json;

    fn config_for(server: &MockServer, dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.github.owner = "owner".to_string();
        config.github.repo = "state".to_string();
        config.github.token = "t".to_string();
        config.github.api_base = server.base_url();
        config.store.db_path = dir.path().join("botforge.db");
        config
    }

    #[test]
    fn restore_fallback_seeds_remote_with_initial_snapshot() {
        let server = MockServer::start();
        // Empty remote: everything under the prefix is absent.
        server.mock(|when, then| {
            when.method(GET).path_includes("/contents/");
            then.status(404).json_body(json!({"message": "Not Found"}));
        });
        let snap = server.mock(|when, then| {
            when.method(PUT).path_includes("botforge_");
            then.status(201)
                .json_body(json!({"content": {"sha": "s"}, "commit": {"sha": "c"}}));
        });
        let ptr = server.mock(|when, then| {
            when.method(PUT).path_includes("latest.txt");
            then.status(201)
                .json_body(json!({"content": {"sha": "p"}, "commit": {"sha": "c"}}));
        });

        let dir = tempfile::tempdir().unwrap();
        restore(&config_for(&server, &dir)).unwrap();

        snap.assert_calls(1);
        ptr.assert_calls(1);
    }

    #[test]
    fn backup_command_surfaces_remote_error_kind() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path_includes("/contents/");
            then.status(404).json_body(json!({"message": "Not Found"}));
        });
        server.mock(|when, then| {
            when.method(PUT).path_includes("botforge_");
            then.status(502);
        });

        let dir = tempfile::tempdir().unwrap();
        let err = backup(&config_for(&server, &dir), "manual").unwrap_err();
        assert!(matches!(
            err,
            BotforgeError::Remote(RemoteError::Unavailable(_))
        ));
    }
}
