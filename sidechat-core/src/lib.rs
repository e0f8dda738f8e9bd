//! Sidechat Core Library
//!
//! This crate provides the core of Sidechat, a page-aware LLM chat sidebar.
//! It includes:
//!
//! - HTML escaping and the markdown renderer for model output
//! - Streaming response assembly over server-sent events
//! - Chat-completions client and request payloads
//! - Database layer for settings and conversation history
//! - Pending image attachments and page-content helpers
//! - The session that dispatches user intents, and its message protocol

pub mod api;
pub mod attachments;
pub mod config;
pub mod conversation;
pub mod db;
pub mod page;
pub mod prompts;
pub mod protocol;
pub mod render;
pub mod session;
pub mod stream;

// Re-exports for convenience
pub use config::{Settings, DEFAULT_MODEL, VISION_MODEL};
pub use db::{Database, StoreError};

pub use api::{ApiError, ChatRequest, ChatTransport, MistralClient};
pub use attachments::{
    AttachBatch, AttachNotice, AttachSource, IncomingFile, PendingImage, PendingImages,
};
pub use conversation::{Conversation, Message, Role};
pub use page::{PageContent, PageContentSource, PageError};
pub use prompts::QuickAction;
pub use protocol::{
    outbox_channel, HostEvent, HostRequest, Outbox, OutboxReceiver, MAX_EVENT_BYTES,
};
pub use render::{escape_html, render_markdown, RenderState};
pub use session::{Dispatch, DispatchError, Session};
pub use stream::{event_channel, EventReceiver, EventSender, StreamAssembler, StreamEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
