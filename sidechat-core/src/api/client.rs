//! reqwest-backed chat-completions transport.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use super::{ApiError, ByteStream, ChatRequest, ChatTransport};

/// Default chat-completions endpoint.
pub const DEFAULT_API_URL: &str = "https://api.mistral.ai/v1/chat/completions";

/// Environment variable overriding the endpoint.
pub const API_URL_ENV: &str = "SIDECHAT_API_URL";

/// Mistral chat-completions client.
#[derive(Debug, Clone)]
pub struct MistralClient {
    http: reqwest::Client,
    url: String,
}

impl Default for MistralClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MistralClient {
    /// Client for the default endpoint, or `$SIDECHAT_API_URL` when set.
    pub fn new() -> Self {
        let url = std::env::var(API_URL_ENV)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self::with_url(url)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatTransport for MistralClient {
    async fn open_stream(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<ByteStream, ApiError> {
        tracing::debug!(
            url = %self.url,
            model = %request.model,
            messages = request.messages.len(),
            "Opening completion stream"
        );

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(status.as_u16(), &body);
            tracing::warn!(status = status.as_u16(), %message, "Completion request rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ApiError::Transport(e.to_string())));
        Ok(Box::pin(stream))
    }
}

/// Description of a non-2xx response.
///
/// Uses the body's `message` (or `error.message`) field, else a generic
/// `API error: <status>`.
pub fn error_message(status: u16, body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    parsed
        .as_ref()
        .and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("error").and_then(|e| e.get("message")))
        })
        .and_then(Value::as_str)
        .filter(|message| !message.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("API error: {status}"))
}
