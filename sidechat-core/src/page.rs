//! Content of the page the sidebar is attached to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Page text beyond this many characters is cut off.
pub const MAX_CONTENT_CHARS: usize = 8000;

/// Appended to truncated page text.
pub const TRUNCATION_MARKER: &str = "...";

/// Snapshot of the active page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageContent {
    pub title: String,
    pub url: String,
    pub description: String,
    pub content: String,
    pub selected_text: String,
}

impl PageContent {
    /// Collapse whitespace in the page text and enforce the length limit.
    pub fn normalized(mut self) -> Self {
        self.content = truncate_content(&clean_text(&self.content));
        self
    }

    /// The user's selection, if any non-blank text is selected.
    pub fn selection(&self) -> Option<&str> {
        let trimmed = self.selected_text.trim();
        (!trimmed.is_empty()).then_some(self.selected_text.as_str())
    }
}

/// Collapse every whitespace run to a single space and trim.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` to [`MAX_CONTENT_CHARS`] characters plus the marker.
pub fn truncate_content(text: &str) -> String {
    match text.char_indices().nth(MAX_CONTENT_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text.to_string(),
    }
}

/// The page round trip failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("page content unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the active page's content on demand.
#[async_trait]
pub trait PageContentSource: Send + Sync {
    async fn page_content(&self) -> Result<PageContent, PageError>;
}
