//! Telegram Bot API sink
//!
//! Sends [`Event::summary`] as a plain text message through `sendMessage`.

use async_trait::async_trait;

use super::{Event, NotificationSink, NotifyError};
use crate::config::TelegramConfig;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug)]
pub struct TelegramSink {
    bot_token: String,
    chat_id: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramSink {
    /// A `bot_token` of the form `${VAR}` is read from the environment.
    pub fn from_config(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let token = match config
            .bot_token
            .strip_prefix("${")
            .and_then(|s| s.strip_suffix('}'))
        {
            Some(var) => std::env::var(var).map_err(|_| {
                NotifyError::Config(format!("Environment variable '{}' is not set", var))
            })?,
            None => config.bot_token.clone(),
        };

        if token.trim().is_empty() {
            return Err(NotifyError::Config(
                "Telegram bot token must not be empty".to_string(),
            ));
        }
        if config.chat_id.trim().is_empty() {
            return Err(NotifyError::Config(
                "Telegram chat_id must not be empty".to_string(),
            ));
        }

        Ok(Self {
            bot_token: token,
            chat_id: config.chat_id.clone(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": event.summary(),
            "disable_web_page_preview": true,
        });

        tracing::debug!(chat_id = %self.chat_id, event = event.kind(), "Sending Telegram notification");

        let response = self.client.post(self.endpoint()).json(&body).send().await?;
        let status = response.status();
        let reply: serde_json::Value = response.json().await?;

        if reply.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            return Ok(());
        }

        let description = reply
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown Telegram API error");
        Err(NotifyError::Rejected(format!("{} ({})", description, status)))
    }
}
