use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::MatrixConfig;
use crate::services::format;
use crate::services::transport::{ChatTransport, TransportError};
use crate::store::operations::papers::Paper;
use crate::store::operations::subscribers::{DeliveryPreferences, Platform};

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

/// Matrix client-server API, room messages only.
#[derive(Clone)]
pub struct MatrixClient {
    http: reqwest::Client,
    homeserver: String,
    access_token: String,
}

impl std::fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixClient")
            .field("homeserver", &self.homeserver)
            .field("access_token", &"***REDACTED***")
            .finish()
    }
}

impl MatrixClient {
    pub fn new(config: &MatrixConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            homeserver: config.homeserver.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        }
    }

    /// Sends an `m.text` event. Returns the event id.
    pub async fn send_message(
        &self,
        room_id: &str,
        body: &str,
        formatted_body: Option<&str>,
    ) -> Result<String, TransportError> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let url = format!(
            "{}/_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            self.homeserver,
            urlencoding::encode(room_id),
            txn_id
        );
        let mut content = json!({ "msgtype": "m.text", "body": body });
        if let Some(html) = formatted_body {
            content["format"] = json!("org.matrix.custom.html");
            content["formatted_body"] = json!(html);
        }

        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(&content)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let status = response.status();

        if status.is_success() {
            let parsed: SendResponse = response
                .json()
                .await
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            tracing::debug!(room_id, event_id = %parsed.event_id, "Matrix message sent");
            return Ok(parsed.event_id);
        }

        let err: MatrixErrorBody = response.json().await.unwrap_or_default();
        if status.as_u16() == 429 {
            let retry_after = err.retry_after_ms.unwrap_or(1_000).div_ceil(1_000);
            return Err(TransportError::RateLimited { retry_after });
        }
        Err(TransportError::Api {
            code: status.as_u16(),
            description: format!("{} {}", err.errcode, err.error).trim().to_string(),
        })
    }
}

#[async_trait]
impl ChatTransport for MatrixClient {
    fn platform(&self) -> Platform {
        Platform::Matrix
    }

    async fn send_paper(
        &self,
        chat_id: &str,
        paper: &Paper,
        prefs: &DeliveryPreferences,
    ) -> Result<(), TransportError> {
        let markdown = format::markdown_message(paper, prefs);
        let html = format::html_message(&markdown);
        self.send_message(chat_id, &markdown, Some(&html)).await?;
        Ok(())
    }
}
