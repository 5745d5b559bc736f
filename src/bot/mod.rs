//! Telegram transport: a minimal blocking client plus the inbound update
//! model. Deliberately thin; all real invariants live in the backup engine.

pub mod commands;

use std::time::Duration;

use serde::Deserialize;

use crate::config::TelegramConfig;
use crate::error::{BotforgeError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub from: Option<TgUser>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramClient {
    client: reqwest::blocking::Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    pub fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .map_err(|err| BotforgeError::Telegram(format!("sendMessage: {err}")))?;

        if !response.status().is_success() {
            return Err(BotforgeError::Telegram(format!(
                "sendMessage: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Long-poll for updates past `offset`.
    pub fn get_updates(&self, offset: i64, poll_timeout_secs: u64) -> Result<Vec<Update>> {
        let response = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", poll_timeout_secs.to_string()),
            ])
            .timeout(Duration::from_secs(poll_timeout_secs + 10))
            .send()
            .map_err(|err| BotforgeError::Telegram(format!("getUpdates: {err}")))?;

        if !response.status().is_success() {
            return Err(BotforgeError::Telegram(format!(
                "getUpdates: HTTP {}",
                response.status()
            )));
        }

        let parsed: ApiResponse<Vec<Update>> = response
            .json()
            .map_err(|err| BotforgeError::Telegram(format!("getUpdates parse: {err}")))?;
        if !parsed.ok {
            return Err(BotforgeError::Telegram(format!(
                "getUpdates rejected: {}",
                parsed.description.unwrap_or_default()
            )));
        }
        Ok(parsed.result.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer) -> TelegramClient {
        let config = TelegramConfig {
            bot_token: "123:abc".to_string(),
            api_base: server.base_url(),
            admin_ids: Vec::new(),
        };
        TelegramClient::new(&config, Duration::from_secs(5))
    }

    #[test]
    fn update_model_parses_message() {
        let raw = json!({
            "update_id": 10,
            "message": {
                "message_id": 1,
                "from": {"id": 7, "username": "alice", "first_name": "Alice"},
                "chat": {"id": 7, "type": "private"},
                "text": "/start"
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        let message = update.message.unwrap();
        assert_eq!(message.chat.id, 7);
        assert_eq!(message.text.as_deref(), Some("/start"));
        assert_eq!(message.from.unwrap().username.as_deref(), Some("alice"));
    }

    #[test]
    fn update_model_tolerates_non_message_updates() {
        let update: Update =
            serde_json::from_value(json!({"update_id": 11, "edited_message": {}})).unwrap();
        assert!(update.message.is_none());
    }

    #[test]
    fn send_message_posts_to_bot_endpoint() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bot123:abc/sendMessage")
                .json_body_includes(r#"{"chat_id": 7}"#);
            then.status(200).json_body(json!({"ok": true, "result": {}}));
        });

        client_for(&server).send_message(7, "hello").unwrap();
        mock.assert();
    }

    #[test]
    fn get_updates_surfaces_api_rejection() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/bot123:abc/getUpdates");
            then.status(200)
                .json_body(json!({"ok": false, "description": "unauthorized"}));
        });

        let err = client_for(&server).get_updates(0, 1).unwrap_err();
        assert!(matches!(err, BotforgeError::Telegram(_)));
    }
}
