//! Messages exchanged with the sidebar extension.
//!
//! Both directions are JSON objects tagged by `type`:
//! - [`HostRequest`] - extension to host (user intents, page-content replies)
//! - [`HostEvent`] - host to extension (state snapshots, stream updates, notices)
//!
//! Events never carry full images, only previews, so each one fits in a
//! single native message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::attachments::{preview_uri, AttachNotice, AttachSource, IncomingFile};
use crate::config::{Settings, AVAILABLE_MODELS};
use crate::conversation::{Message, Role};
use crate::page::PageContent;
use crate::prompts::QuickAction;
use crate::render::render_markdown;
use crate::stream::RequestId;

/// Largest event the browser accepts from a native host.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

// =============================================================================
// Requests
// =============================================================================

/// A request from the extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostRequest {
    /// Panel opened; reply with a full `state` snapshot.
    Init,

    /// Send the composer text together with any pending images.
    SendMessage {
        #[serde(default)]
        text: String,
    },

    /// File `index` of a `count`-file pick or drop. Files of one batch are
    /// sent in order, one per message.
    AttachImage {
        source: AttachSource,
        index: usize,
        count: usize,
        file: IncomingFile,
    },

    RemoveImage { index: usize },

    ClearImages,

    QuickAction { action: QuickAction },

    /// Context-menu click. `action` is the menu item id, e.g. `ai-explain`.
    ContextMenuAction {
        action: String,
        #[serde(default)]
        text: String,
    },

    /// Reply to a `get-page-content` event.
    PageContent {
        #[serde(default)]
        page: Option<PageContent>,
        #[serde(default)]
        error: Option<String>,
    },

    NewChat,

    #[serde(rename_all = "camelCase")]
    SaveSettings {
        api_key: String,
        #[serde(default)]
        model: String,
    },
}

impl HostRequest {
    /// Wire name of the request, for logging without payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            HostRequest::Init => "init",
            HostRequest::SendMessage { .. } => "send-message",
            HostRequest::AttachImage { .. } => "attach-image",
            HostRequest::RemoveImage { .. } => "remove-image",
            HostRequest::ClearImages => "clear-images",
            HostRequest::QuickAction { .. } => "quick-action",
            HostRequest::ContextMenuAction { .. } => "context-menu-action",
            HostRequest::PageContent { .. } => "page-content",
            HostRequest::NewChat => "new-chat",
            HostRequest::SaveSettings { .. } => "save-settings",
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// A message as displayed, with its content already rendered and its images
/// replaced by previews.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedMessage {
    pub role: Role,
    pub content: String,
    pub html: String,
    pub images: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub is_error: bool,
}

impl From<&Message> for RenderedMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            html: render_markdown(&message.content),
            images: message.images.iter().map(|uri| preview_uri(uri)).collect(),
            timestamp: message.timestamp,
            is_error: message.is_error,
        }
    }
}

/// Settings as shown in the settings panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub api_key: String,
    pub model: String,
    pub available_models: Vec<String>,
}

impl From<&Settings> for SettingsView {
    fn from(settings: &Settings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            available_models: AVAILABLE_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// An event for the extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostEvent {
    /// Start of a snapshot. The panel clears its transcript; one
    /// `message-appended` per stored message follows.
    #[serde(rename_all = "camelCase")]
    State {
        pending_images: Vec<String>,
        settings: SettingsView,
        responding: bool,
    },

    MessageAppended { message: RenderedMessage },

    /// Waiting for the first chunk of a response.
    #[serde(rename_all = "camelCase")]
    Typing { request_id: RequestId },

    /// Full render of the in-progress response.
    #[serde(rename_all = "camelCase")]
    StreamUpdate { request_id: RequestId, html: String },

    /// Drop the in-progress response display.
    #[serde(rename_all = "camelCase")]
    StreamCancelled { request_id: RequestId },

    /// Previews of the pending images.
    PendingImages { images: Vec<String> },

    /// Transient toast.
    #[serde(rename_all = "camelCase")]
    Notice { message: String, is_error: bool },

    OpenSettings,

    /// Ask the extension for the active page's content.
    GetPageContent,

    ConversationReset,

    RespondingChanged { responding: bool },
}

impl HostEvent {
    pub fn notice(message: impl Into<String>, is_error: bool) -> Self {
        HostEvent::Notice {
            message: message.into(),
            is_error,
        }
    }

    pub fn error_notice(message: impl Into<String>) -> Self {
        Self::notice(message, true)
    }
}

impl From<&AttachNotice> for HostEvent {
    fn from(notice: &AttachNotice) -> Self {
        HostEvent::notice(notice.message(), notice.is_error())
    }
}

/// Sender for events bound to the extension.
pub type Outbox = mpsc::UnboundedSender<HostEvent>;

/// Receiver draining events bound to the extension.
pub type OutboxReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Create the outbound event channel.
pub fn outbox_channel() -> (Outbox, OutboxReceiver) {
    mpsc::unbounded_channel()
}
