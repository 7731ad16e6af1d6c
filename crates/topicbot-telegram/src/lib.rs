//! Telegram delivery backend.
//!
//! Sends scheduled messages into group chats and forum topics over the Bot
//! API (plain HTTPS, no webhook required).
//!
//! # Configuration
//!
//! ```json5
//! telegram: {
//!     bot_token: "123456:ABC-DEF...",
//! }
//! ```

pub mod api;
pub mod types;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use topicbot_scheduler::{MessageSender, SendError};
use topicbot_types::{Payload, Target};

use api::TelegramApi;
use types::{GetUpdatesParams, SendMessageParams};

/// A chat (and optionally topic) seen in recent bot updates.
#[derive(Debug)]
pub struct SeenChat {
    pub chat_id: i64,
    pub topic_id: Option<i64>,
    pub title: Option<String>,
}

/// Production [`MessageSender`] backed by the Bot API.
pub struct TelegramSender {
    api: TelegramApi,
}

impl TelegramSender {
    pub fn new(bot_token: &str) -> Self {
        Self {
            api: TelegramApi::new(bot_token),
        }
    }

    /// Verify the bot token at startup by calling `getMe`.
    pub async fn verify(&self) -> anyhow::Result<()> {
        let bot = self.api.get_me().await?;
        info!(
            bot_username = bot.username.as_deref().unwrap_or("unknown"),
            "Telegram bot authenticated"
        );
        Ok(())
    }

    /// Collect the chats and topics that messaged the bot recently.
    ///
    /// One long-poll round; send any message to the bot (or into a topic it
    /// can read) and the chat shows up here.
    pub async fn discover_chats(&self, timeout_secs: i64) -> anyhow::Result<Vec<SeenChat>> {
        let updates = self
            .api
            .get_updates(&GetUpdatesParams {
                offset: None,
                timeout: Some(timeout_secs),
            })
            .await?;

        let mut seen = Vec::new();
        for update in updates {
            if let Some(msg) = update.message {
                seen.push(SeenChat {
                    chat_id: msg.chat.id,
                    topic_id: msg.message_thread_id,
                    title: msg.chat.title,
                });
            }
        }
        Ok(seen)
    }

    fn params(target: &Target, payload: &Payload, parse_mode: Option<String>) -> SendMessageParams {
        SendMessageParams {
            chat_id: target.chat_id,
            message_thread_id: target.topic_id,
            text: payload.text.clone(),
            parse_mode,
        }
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, target: &Target, payload: &Payload) -> Result<(), SendError> {
        let result = self
            .api
            .send_message(&Self::params(target, payload, payload.parse_mode.clone()))
            .await;

        // Formatting rejections are a property of the text, not the
        // destination: retry once as plain text before giving up.
        match result {
            Ok(msg) => {
                debug!(
                    chat_id = target.chat_id,
                    topic_id = ?target.topic_id,
                    message_id = msg.message_id,
                    "message delivered"
                );
                Ok(())
            }
            Err(SendError::Permanent(reason))
                if payload.parse_mode.is_some() && reason.contains("can't parse entities") =>
            {
                warn!(
                    chat_id = target.chat_id,
                    "formatting rejected, resending as plain text: {reason}"
                );
                self.api
                    .send_message(&Self::params(target, payload, None))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
