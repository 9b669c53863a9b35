use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::TelegramConfig;
use crate::services::format;
use crate::services::transport::{ChatTransport, TransportError};
use crate::store::operations::papers::Paper;
use crate::store::operations::subscribers::{DeliveryPreferences, Platform};

/// Longest wait honoured for a 429 before giving up.
const MAX_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineKeyboardButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    MarkdownV2,
}

impl ParseMode {
    fn as_str(&self) -> &'static str {
        match self {
            ParseMode::MarkdownV2 => "MarkdownV2",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

/// Telegram Bot API client.
#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    poll_timeout_secs: u64,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("base_url", &"***REDACTED***")
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: format!(
                "{}/bot{}",
                config.api_url.trim_end_matches('/'),
                config.token
            ),
            poll_timeout_secs: config.poll_timeout_secs,
        }
    }

    pub fn poll_timeout_secs(&self) -> u64 {
        self.poll_timeout_secs
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<T, TransportError> {
        let mut request = self.http.post(format!("{}/{}", self.base_url, method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status();
        let raw = response.text().await.map_err(TransportError::from_reqwest)?;
        let parsed: ApiResponse<T> = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(TransportError::Api {
                    code: status.as_u16(),
                    description: raw.chars().take(200).collect(),
                });
            }
            Err(e) => return Err(TransportError::Decode(e.to_string())),
        };

        if parsed.ok {
            return parsed
                .result
                .ok_or_else(|| TransportError::Decode(format!("{method}: missing result")));
        }

        let code = parsed.error_code.unwrap_or(status.as_u16());
        if code == 429 {
            let retry_after = parsed
                .parameters
                .and_then(|p| p.retry_after)
                .unwrap_or(1);
            return Err(TransportError::RateLimited { retry_after });
        }
        Err(TransportError::Api {
            code,
            description: parsed.description.unwrap_or_default(),
        })
    }

    /// One retry after a 429, waiting the advertised `retry_after`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
        timeout: Option<Duration>,
    ) -> Result<T, TransportError> {
        match self.call_once(method, &body, timeout).await {
            Err(TransportError::RateLimited { retry_after }) if retry_after <= MAX_RETRY_AFTER_SECS => {
                tracing::warn!(method, retry_after, "Telegram rate limit hit, waiting");
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                self.call_once(method, &body, timeout).await
            }
            other => other,
        }
    }

    pub async fn get_me(&self) -> Result<User, TransportError> {
        self.call("getMe", json!({}), None).await
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<ParseMode>,
        reply_markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode.as_str());
        }
        if let Some(markup) = reply_markup {
            body["reply_markup"] = json!(markup);
        }
        self.call("sendMessage", body, None).await
    }

    pub async fn edit_message_text(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        reply_markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), TransportError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = json!(markup);
        }
        // result is the edited Message, or `true` for inline messages
        let _: Value = self.call("editMessageText", body, None).await?;
        Ok(())
    }

    pub async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<(), TransportError> {
        let _: bool = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut body = json!({ "callback_query_id": callback_query_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", body, None).await?;
        Ok(())
    }

    /// Long poll. The HTTP timeout is extended past the server-side wait.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call(
            "getUpdates",
            body,
            Some(Duration::from_secs(timeout_secs + 10)),
        )
        .await
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn send_paper(
        &self,
        chat_id: &str,
        paper: &Paper,
        prefs: &DeliveryPreferences,
    ) -> Result<(), TransportError> {
        let text = format::telegram_message(paper, prefs);
        self.send_message(chat_id, &text, Some(ParseMode::MarkdownV2), None)
            .await?;
        Ok(())
    }
}
