//! Telegram Bot API HTTP client.
//!
//! Delivery calls return the engine's classified [`SendError`] so the
//! scheduler can decide between retrying, honoring a rate-limit hint, and
//! giving up. Startup and diagnostic calls stay on `anyhow`.

use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::Client;
use serde::de::DeserializeOwned;

use topicbot_scheduler::SendError;

use crate::types::{ApiResponse, BotInfo, GetUpdatesParams, SendMessageParams, TgMessage, Update};

/// HTTP client for the Telegram Bot API.
pub struct TelegramApi {
    client: Client,
    base_url: String,
}

impl TelegramApi {
    /// Create a new API client with the given bot token.
    pub fn new(bot_token: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
        }
    }

    /// Verify the bot token by calling `getMe`.
    pub async fn get_me(&self) -> anyhow::Result<BotInfo> {
        let resp: ApiResponse<BotInfo> = self
            .client
            .get(format!("{}/getMe", self.base_url))
            .send()
            .await
            .context("getMe request failed")?
            .json()
            .await
            .context("getMe response parse failed")?;

        if !resp.ok {
            bail!(
                "getMe failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        resp.result.context("getMe returned no result")
    }

    /// Long-poll for updates. Used by the chat-id discovery command.
    pub async fn get_updates(&self, params: &GetUpdatesParams) -> anyhow::Result<Vec<Update>> {
        let resp: ApiResponse<Vec<Update>> = self
            .client
            .post(format!("{}/getUpdates", self.base_url))
            .json(params)
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates response parse failed")?;

        if !resp.ok {
            bail!(
                "getUpdates failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(resp.result.unwrap_or_default())
    }

    /// Send a text message, classifying any failure.
    pub async fn send_message(
        &self,
        params: &SendMessageParams,
    ) -> Result<TgMessage, SendError> {
        let resp: ApiResponse<TgMessage> = self
            .post_classified("sendMessage", params)
            .await?;

        if !resp.ok {
            return Err(classify_api_error(&resp));
        }
        resp.result
            .ok_or_else(|| SendError::Transient("sendMessage returned no result".into()))
    }

    async fn post_classified<P, T>(&self, method: &str, params: &P) -> Result<ApiResponse<T>, SendError>
    where
        P: serde::Serialize,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(params)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        // Telegram puts the real error in the JSON body even on non-2xx
        // statuses, so parse the body before looking at the status line.
        match response.json::<ApiResponse<T>>().await {
            Ok(resp) => Ok(resp),
            Err(e) if status.is_server_error() => {
                Err(SendError::Transient(format!("upstream {status}: {e}")))
            }
            Err(e) => Err(SendError::Transient(format!(
                "{method} response parse failed: {e}"
            ))),
        }
    }
}

fn classify_transport_error(e: reqwest::Error) -> SendError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SendError::Transient(format!("network error: {e}"))
    } else {
        SendError::Transient(format!("http error: {e}"))
    }
}

/// Map a non-ok API body onto the engine's failure taxonomy.
fn classify_api_error<T>(resp: &ApiResponse<T>) -> SendError {
    let description = resp
        .description
        .clone()
        .unwrap_or_else(|| "unknown error".into());

    // 429 with an explicit hint is the only case the scheduler treats as a
    // verbatim delay; a 429 without one is an ordinary transient failure.
    if resp.error_code == Some(429) {
        if let Some(secs) = resp.parameters.as_ref().and_then(|p| p.retry_after) {
            return SendError::RateLimited {
                retry_after: Duration::from_secs(secs),
            };
        }
        return SendError::Transient(description);
    }

    match resp.error_code {
        Some(code) if (400..500).contains(&code) => {
            if let Some(new_id) = resp
                .parameters
                .as_ref()
                .and_then(|p| p.migrate_to_chat_id)
            {
                SendError::Permanent(format!(
                    "{description} (chat migrated to {new_id}; update the job target)"
                ))
            } else {
                SendError::Permanent(format!("{code}: {description}"))
            }
        }
        Some(code) => SendError::Transient(format!("{code}: {description}")),
        None => SendError::Transient(description),
    }
}
