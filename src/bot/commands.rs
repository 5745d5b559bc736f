//! Command dispatch: parse inbound text, mutate the store, feed the backup
//! engine. Each handler is a thin wrapper; acknowledgement to the user is
//! independent of whether a triggered push has finished.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backup::policy::{WriteEvent, WriteKind};
use crate::backup::{BackupCoordinator, PushOutcome};
use crate::bot::{TelegramClient, TgUser, Update};
use crate::config::Config;
use crate::error::Result;

pub struct Dispatcher {
    telegram: Arc<TelegramClient>,
    coordinator: Arc<BackupCoordinator>,
    admin_ids: Vec<i64>,
    star_price: u32,
}

impl Dispatcher {
    pub fn new(
        telegram: Arc<TelegramClient>,
        coordinator: Arc<BackupCoordinator>,
        config: &Config,
    ) -> Self {
        Self {
            telegram,
            coordinator,
            admin_ids: config.telegram.admin_ids.clone(),
            star_price: config.factory.star_price,
        }
    }

    fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    /// Entry point for one inbound update. Never propagates errors to the
    /// transport loop; failures are logged and answered with a generic reply.
    pub fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text else {
            return;
        };
        let Some(from) = message.from else {
            return;
        };
        let chat_id = message.chat.id;

        if let Err(err) = self.handle_text(chat_id, &from, text.trim()) {
            warn!(chat_id, user = from.id, "command failed: {err}");
            self.reply(chat_id, "Something went wrong, please try again later.");
        }
    }

    fn handle_text(&self, chat_id: i64, from: &TgUser, text: &str) -> Result<()> {
        let created = self.coordinator.with_store(|db| {
            let created = db.upsert_user(from.id, from.username.as_deref(), from.first_name.as_deref())?;
            db.log_activity(Some(from.id), "message", text)?;
            Ok(created)
        })?;
        let kind = if created {
            WriteKind::UserRegistration
        } else {
            WriteKind::UserActivity
        };
        self.coordinator
            .record_write(WriteEvent::new(kind, Some(from.id), 1));

        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or("");
        let arg = parts.next();
        let arg2 = parts.next();

        match command {
            "/start" => self.cmd_start(chat_id, from),
            "/balance" => self.cmd_balance(chat_id, from),
            "/buystars" => self.cmd_buystars(chat_id, from),
            "/verify" => self.cmd_verify(chat_id, from, arg),
            "/newbot" => self.cmd_newbot(chat_id, from, arg),
            "/mybots" => self.cmd_mybots(chat_id, from),
            "/backup" => self.cmd_backup(chat_id, from),
            "/stats" => self.cmd_stats(chat_id, from),
            "/set" => self.cmd_set(chat_id, from, arg, arg2),
            _ => {
                self.reply(chat_id, HELP_TEXT);
                Ok(())
            }
        }
    }

    fn cmd_start(&self, chat_id: i64, from: &TgUser) -> Result<()> {
        let name = from.first_name.as_deref().unwrap_or("there");
        self.reply(
            chat_id,
            &format!(
                "Welcome, {name}!\n\nThis is the bot factory. A new bot costs {} stars.\n{HELP_TEXT}",
                self.star_price
            ),
        );
        Ok(())
    }

    fn cmd_balance(&self, chat_id: i64, from: &TgUser) -> Result<()> {
        let balance = self
            .coordinator
            .with_store(|db| db.get_user(from.id))?
            .map(|user| user.stars_balance)
            .unwrap_or(0);
        self.reply(chat_id, &format!("Your balance: {balance} stars."));
        Ok(())
    }

    fn cmd_buystars(&self, chat_id: i64, from: &TgUser) -> Result<()> {
        let payment_id = self
            .coordinator
            .with_store(|db| db.record_payment(from.id, i64::from(self.star_price)))?;
        self.coordinator
            .record_write(WriteEvent::new(WriteKind::LedgerAdjust, Some(from.id), 1));
        self.reply(
            chat_id,
            &format!(
                "Payment {payment_id} created for {} stars.\nAn admin will verify it shortly.",
                self.star_price
            ),
        );
        Ok(())
    }

    fn cmd_verify(&self, chat_id: i64, from: &TgUser, arg: Option<&str>) -> Result<()> {
        if !self.is_admin(from.id) {
            self.reply(chat_id, "Admins only.");
            return Ok(());
        }
        let Some(payment_id) = arg else {
            self.reply(chat_id, "Usage: /verify <payment-id>");
            return Ok(());
        };

        let settled = self
            .coordinator
            .with_store(|db| db.settle_payment(payment_id, from.id))?;
        match settled {
            Some(payment) => {
                // Settlement is an immediate-push kind.
                self.coordinator.record_write(WriteEvent::new(
                    WriteKind::StarPayment,
                    Some(payment.user_id),
                    2,
                ));
                info!(payment_id, user = payment.user_id, "payment settled");
                self.reply(
                    chat_id,
                    &format!(
                        "Verified: {} stars credited to {}.",
                        payment.stars_amount, payment.user_id
                    ),
                );
            }
            None => self.reply(chat_id, "Unknown or already-settled payment id."),
        }
        Ok(())
    }

    fn cmd_newbot(&self, chat_id: i64, from: &TgUser, arg: Option<&str>) -> Result<()> {
        let Some(bot_token) = arg else {
            self.reply(chat_id, "Usage: /newbot <bot-token>");
            return Ok(());
        };

        let price = i64::from(self.star_price);
        let provisioned = self.coordinator.with_store(|db| {
            if !db.debit_stars(from.id, price)? {
                return Ok(false);
            }
            db.register_bot(bot_token, None, from.id, price)?;
            db.log_activity(Some(from.id), "bot_provision", bot_token)?;
            Ok(true)
        })?;

        if provisioned {
            self.coordinator
                .record_write(WriteEvent::new(WriteKind::BotProvision, Some(from.id), 2));
            self.reply(chat_id, "Bot provisioned. Manage it with /mybots.");
        } else {
            self.reply(
                chat_id,
                &format!("Not enough stars: a bot costs {price}. Top up with /buystars."),
            );
        }
        Ok(())
    }

    fn cmd_mybots(&self, chat_id: i64, from: &TgUser) -> Result<()> {
        let bots = self.coordinator.with_store(|db| db.list_bots_for(from.id))?;
        if bots.is_empty() {
            self.reply(chat_id, "You have no bots yet. Create one with /newbot.");
            return Ok(());
        }
        let lines: Vec<String> = bots
            .iter()
            .map(|bot| {
                let status = if bot.is_active { "active" } else { "inactive" };
                format!("- {} ({status})", mask_token(&bot.bot_token))
            })
            .collect();
        self.reply(chat_id, &format!("Your bots:\n{}", lines.join("\n")));
        Ok(())
    }

    fn cmd_backup(&self, chat_id: i64, from: &TgUser) -> Result<()> {
        if !self.is_admin(from.id) {
            self.reply(chat_id, "Admins only.");
            return Ok(());
        }
        match self.coordinator.force_push("manual") {
            PushOutcome::Completed(blob) => {
                self.reply(chat_id, &format!("Backup pushed: {}", blob.path));
            }
            PushOutcome::Failed { error } => {
                self.reply(chat_id, &format!("Backup failed: {error}"));
            }
        }
        Ok(())
    }

    /// Admin settings mutation; `auto_backup_enabled` and `backup_interval`
    /// take effect at the next trigger evaluation.
    fn cmd_set(
        &self,
        chat_id: i64,
        from: &TgUser,
        key: Option<&str>,
        value: Option<&str>,
    ) -> Result<()> {
        if !self.is_admin(from.id) {
            self.reply(chat_id, "Admins only.");
            return Ok(());
        }
        let (Some(key), Some(value)) = (key, value) else {
            self.reply(chat_id, "Usage: /set <key> <value>");
            return Ok(());
        };

        self.coordinator.with_store(|db| db.set_setting(key, value))?;
        self.coordinator
            .record_write(WriteEvent::new(WriteKind::SettingChange, Some(from.id), 1));
        info!(key, value, admin = from.id, "setting updated");
        self.reply(chat_id, &format!("Setting {key} = {value}."));
        Ok(())
    }

    fn cmd_stats(&self, chat_id: i64, from: &TgUser) -> Result<()> {
        if !self.is_admin(from.id) {
            self.reply(chat_id, "Admins only.");
            return Ok(());
        }
        let stats = self.coordinator.stats();
        let counts = self.coordinator.with_store(|db| db.counts())?;
        let last = stats
            .last_push_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        self.reply(
            chat_id,
            &format!(
                "Users: {}\nPayments: {}\nBots: {}\nPushes: {} (pending writes: {}, last: {last})",
                counts.users, counts.payments, counts.bots, stats.push_count, stats.pending_count
            ),
        );
        Ok(())
    }

    /// Best-effort reply; transport failures never fail the handler.
    fn reply(&self, chat_id: i64, text: &str) {
        if let Err(err) = self.telegram.send_message(chat_id, text) {
            warn!(chat_id, "reply failed: {err}");
        }
    }
}

const HELP_TEXT: &str = "Commands:\n\
    /balance - your star balance\n\
    /buystars - request a star purchase\n\
    /newbot <token> - provision a bot\n\
    /mybots - list your bots";

fn mask_token(token: &str) -> String {
    match token.split_once(':') {
        Some((id, _)) => format!("{id}:***"),
        None => "***".to_string(),
    }
}

/// Long-poll loop: one thread per inbound update, as with a webhook pool.
pub fn run_loop(dispatcher: Arc<Dispatcher>, telegram: Arc<TelegramClient>) -> ! {
    let mut offset = 0i64;
    loop {
        match telegram.get_updates(offset, 30) {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let dispatcher = Arc::clone(&dispatcher);
                    std::thread::spawn(move || dispatcher.handle_update(update));
                }
            }
            Err(err) => {
                warn!("getUpdates failed: {err}");
                std::thread::sleep(std::time::Duration::from_secs(3));
            }
        }
    }
}
