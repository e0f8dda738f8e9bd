//! Conversation log.
//!
//! The whole conversation is stored as one JSON array under
//! `conversationHistory` and rewritten after every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Database, StoreError};

/// Storage key for the conversation log.
pub const HISTORY_KEY: &str = "conversationHistory";

// =============================================================================
// Message
// =============================================================================

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredMessage")]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Attached images as data URIs, at most three.
    pub images: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Set on the synthetic assistant message produced by a failed request.
    pub is_error: bool,
}

impl Message {
    pub fn user(content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images,
            timestamp: Utc::now(),
            is_error: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            images: Vec::new(),
            timestamp: Utc::now(),
            is_error: false,
        }
    }

    /// Assistant message describing a failed request.
    pub fn error(description: &str) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(format!(
                "Sorry, I encountered an error: {description}. Please check your API key and try again."
            ))
        }
    }
}

/// On-disk shape, tolerant of older records.
///
/// Early versions stored a single `image` string instead of `images`, and
/// only error messages carry `isError`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    is_error: bool,
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        let mut images = stored.images;
        if images.is_empty() {
            if let Some(image) = stored.image {
                images.push(image);
            }
        }
        Self {
            role: stored.role,
            content: stored.content,
            images,
            timestamp: stored.timestamp,
            is_error: stored.is_error,
        }
    }
}

// =============================================================================
// Conversation
// =============================================================================

/// Ordered message log. Append-only except for a full reset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the stored conversation. Missing or unreadable history is empty.
    pub fn load(db: &Database) -> Self {
        match db.get::<Vec<Message>>(HISTORY_KEY) {
            Ok(Some(messages)) => {
                tracing::debug!(count = messages.len(), "Loaded conversation history");
                Self { messages }
            }
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load conversation history, starting empty");
                Self::default()
            }
        }
    }

    /// Write the whole conversation to the store.
    pub fn persist(&self, db: &Database) -> Result<(), StoreError> {
        db.set(HISTORY_KEY, &self.messages)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Drop every message (new chat).
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
