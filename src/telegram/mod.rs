//! Minimal Telegram Bot API client.
//!
//! Only the calls the bridge needs: `sendMessage` for plain-text notifications and
//! command replies, `editMessageText` to extend a sent notification with further
//! gateway receptions, and `getUpdates` long polling for incoming commands. Errors
//! never include the request URL, which embeds the bot token.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::bridge::dispatch::TelegramSink;
use crate::config::TelegramConfig;

/// Telegram rejects messages longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("telegram request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telegram API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("telegram request timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<Option<T>, DispatchError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(DispatchError::Api {
                code: self.error_code.unwrap_or(0),
                description: self.description.unwrap_or_else(|| "unknown error".into()),
            })
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    /// `private`, `group`, `supergroup` or `channel`
    #[serde(rename = "type")]
    pub kind: String,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.kind == "private"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Serialize)]
struct EditMessageText<'a> {
    chat_id: i64,
    message_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// The part of a sent `Message` the bridge keeps.
#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Serialize)]
struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
}

impl TelegramClient {
    pub fn new(cfg: &TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!(
                "{}/bot{}",
                cfg.api_base.trim_end_matches('/'),
                cfg.bot_token.trim()
            ),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs.max(1)),
        }
    }

    async fn call<B, T>(
        &self,
        method: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<Option<T>, DispatchError>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let request = self
            .client
            .post(format!("{}/{}", self.endpoint, method))
            .json(body)
            .send();
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| DispatchError::Timeout(timeout))?
            .map_err(|e| DispatchError::Http(e.without_url()))?;
        // Telegram reports API errors as JSON bodies on non-2xx statuses too.
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| DispatchError::Http(e.without_url()))?;
        parsed.into_result()
    }

    /// Send plain text, truncated to [`MAX_MESSAGE_CHARS`]. Returns the new message id.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, DispatchError> {
        let text = truncate_chars(text, MAX_MESSAGE_CHARS);
        let body = SendMessage {
            chat_id,
            text: &text,
            disable_web_page_preview: true,
        };
        let sent: Option<SentMessage> = self
            .call("sendMessage", &body, self.request_timeout)
            .await?;
        sent.map(|m| m.message_id).ok_or_else(|| DispatchError::Api {
            code: 0,
            description: "sendMessage returned no message".into(),
        })
    }

    /// Replace the text of a message sent earlier by the bot.
    pub async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), DispatchError> {
        let text = truncate_chars(text, MAX_MESSAGE_CHARS);
        let body = EditMessageText {
            chat_id,
            message_id,
            text: &text,
            disable_web_page_preview: true,
        };
        self.call::<_, serde_json::Value>("editMessageText", &body, self.request_timeout)
            .await
            .map(|_| ())
    }

    /// Long-poll for new messages starting at `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, DispatchError> {
        let body = GetUpdates {
            offset,
            timeout: timeout_secs,
            allowed_updates: ["message"],
        };
        let wait = self.request_timeout + Duration::from_secs(timeout_secs);
        Ok(self.call("getUpdates", &body, wait).await?.unwrap_or_default())
    }

    pub async fn get_me(&self) -> Result<Option<User>, DispatchError> {
        self.call("getMe", &serde_json::json!({}), self.request_timeout)
            .await
    }
}

#[async_trait::async_trait]
impl TelegramSink for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<i64, DispatchError> {
        self.send_message(chat_id, text).await
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), DispatchError> {
        self.edit_message(chat_id, message_id, text).await
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_maps_to_dispatch_error() {
        let raw = r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#;
        let parsed: ApiResponse<serde_json::Value> = serde_json::from_str(raw).unwrap();
        match parsed.into_result() {
            Err(DispatchError::Api { code, description }) => {
                assert_eq!(code, 403);
                assert!(description.contains("blocked"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn updates_deserialize() {
        let raw = r#"{"ok":true,"result":[{"update_id":10,"message":{"message_id":1,
            "from":{"id":222,"is_bot":false,"first_name":"A"},
            "chat":{"id":222,"type":"private"},"text":"/status"}},
            {"update_id":11,"edited_message":{}}]}"#;
        let parsed: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let updates = parsed.into_result().unwrap().unwrap();
        assert_eq!(updates.len(), 2);
        let msg = updates[0].message.as_ref().unwrap();
        assert!(msg.chat.is_private());
        assert_eq!(msg.from.as_ref().unwrap().id, 222);
        assert!(updates[1].message.is_none());
    }

    #[test]
    fn sent_message_id_is_read() {
        let raw = r#"{"ok":true,"result":{"message_id":4711,"date":0,
            "chat":{"id":-100,"type":"supergroup"},"text":"Base: hi"}}"#;
        let parsed: ApiResponse<SentMessage> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.into_result().unwrap().unwrap().message_id, 4711);

        let body = serde_json::to_value(EditMessageText {
            chat_id: -100,
            message_id: 4711,
            text: "Base: hi",
            disable_web_page_preview: true,
        })
        .unwrap();
        assert_eq!(body["message_id"], 4711);
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_chars("ääää", 2), "ää");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
