//! Chat-completions API.
//!
//! - Request payload types and [`ChatRequest::new`], which flattens the
//!   conversation into the wire format
//! - [`ChatTransport`], the seam between the session and the network
//! - [`MistralClient`], the reqwest-backed transport

mod client;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use thiserror::Error;

use crate::config::Settings;
use crate::conversation::{Message, Role};

pub use client::{MistralClient, API_URL_ENV, DEFAULT_API_URL};

// =============================================================================
// Errors
// =============================================================================

/// Failure talking to the API. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Connection, TLS or mid-stream read failure.
    #[error("{0}")]
    Transport(String),

    /// Non-2xx response. `message` is the server's description when it sent one.
    #[error("{message}")]
    Status { status: u16, message: String },
}

// =============================================================================
// Request payload
// =============================================================================

/// One part of a multi-part user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: String },
}

/// Message content: plain text, or text plus images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ApiContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: ApiContent,
}

/// Body of a streaming chat-completions request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ApiMessage>,
    pub stream: bool,
}

impl ChatRequest {
    /// Build the request for a new user turn.
    ///
    /// `prior` is the conversation before this turn; it is sent as text only.
    /// `images` go on the new turn alone, and their presence switches the
    /// model to the vision model.
    pub fn new(prior: &[Message], prompt: &str, images: &[String], settings: &Settings) -> Self {
        let mut messages: Vec<ApiMessage> = prior
            .iter()
            .map(|msg| ApiMessage {
                role: msg.role,
                content: ApiContent::Text(msg.content.clone()),
            })
            .collect();

        let content = if images.is_empty() {
            ApiContent::Text(prompt.to_string())
        } else {
            let mut parts = Vec::with_capacity(images.len() + 1);
            parts.push(ContentPart::Text {
                text: prompt.to_string(),
            });
            parts.extend(images.iter().map(|image| ContentPart::ImageUrl {
                image_url: image.clone(),
            }));
            ApiContent::Parts(parts)
        };
        messages.push(ApiMessage {
            role: Role::User,
            content,
        });

        Self {
            model: settings.model_for(!images.is_empty()).to_string(),
            messages,
            stream: true,
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Raw response body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// Opens a streaming completion.
///
/// Returns once the response status is known; a non-2xx status is an
/// `ApiError::Status`.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, api_key: &str, request: &ChatRequest)
        -> Result<ByteStream, ApiError>;
}
