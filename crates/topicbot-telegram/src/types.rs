//! Telegram Bot API types (minimal subset).

use serde::{Deserialize, Serialize};

/// Generic Telegram API response wrapper.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

/// Extra failure details Telegram attaches to some errors.
#[derive(Debug, Deserialize)]
pub struct ResponseParameters {
    /// Seconds to wait before retrying (429 responses).
    #[serde(default)]
    pub retry_after: Option<u64>,
    /// The group was upgraded to a supergroup under this new id.
    #[serde(default)]
    pub migrate_to_chat_id: Option<i64>,
}

/// Bot identity returned by `getMe`.
#[derive(Debug, Deserialize)]
pub struct BotInfo {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// A Telegram Update object.
#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
}

/// A Telegram message.
#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub date: i64,
    pub chat: Chat,
    /// Topic id when the message was posted in a forum thread.
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
}

/// A Telegram chat.
#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Parameters for `getUpdates`.
#[derive(Debug, Serialize)]
pub struct GetUpdatesParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

/// Parameters for `sendMessage`.
#[derive(Debug, Serialize)]
pub struct SendMessageParams {
    pub chat_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i64>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_ok() {
        let json = r#"{"ok":true,"result":{"id":123,"is_bot":true,"first_name":"TestBot"}}"#;
        let resp: ApiResponse<BotInfo> = serde_json::from_str(json).unwrap();
        assert!(resp.ok);
        let bot = resp.result.unwrap();
        assert_eq!(bot.id, 123);
        assert!(bot.is_bot);
    }

    #[test]
    fn test_api_response_rate_limited() {
        let json = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 27","parameters":{"retry_after":27}}"#;
        let resp: ApiResponse<TgMessage> = serde_json::from_str(json).unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.error_code, Some(429));
        assert_eq!(resp.parameters.unwrap().retry_after, Some(27));
    }

    #[test]
    fn test_api_response_migrated() {
        let json = r#"{"ok":false,"error_code":400,"description":"Bad Request: group chat was upgraded","parameters":{"migrate_to_chat_id":-1009876}}"#;
        let resp: ApiResponse<TgMessage> = serde_json::from_str(json).unwrap();
        assert_eq!(resp.parameters.unwrap().migrate_to_chat_id, Some(-1009876));
    }

    #[test]
    fn test_send_message_params_with_thread() {
        let params = SendMessageParams {
            chat_id: -100123,
            message_thread_id: Some(42),
            text: "standup".into(),
            parse_mode: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["message_thread_id"], 42);
        assert!(!json.as_object().unwrap().contains_key("parse_mode"));
    }

    #[test]
    fn test_send_message_params_skip_thread() {
        let params = SendMessageParams {
            chat_id: 42,
            message_thread_id: None,
            text: "hi".into(),
            parse_mode: Some("Markdown".into()),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert!(!json.as_object().unwrap().contains_key("message_thread_id"));
        assert_eq!(json["parse_mode"], "Markdown");
    }

    #[test]
    fn test_update_with_topic_message() {
        let json = r#"{
            "update_id": 100,
            "message": {
                "message_id": 7,
                "date": 1700000000,
                "chat": {"id": -100555, "type": "supergroup", "title": "Ops"},
                "message_thread_id": 12,
                "text": "/chatid"
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.id, -100555);
        assert_eq!(msg.message_thread_id, Some(12));
        assert_eq!(msg.chat.title.as_deref(), Some("Ops"));
    }
}
