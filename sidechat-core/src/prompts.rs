//! Instruction templates for quick actions and context-menu actions.
//!
//! Each template embeds the page or selection text into a natural-language
//! request that is sent as a normal user turn.

use serde::{Deserialize, Serialize};

use crate::page::PageContent;

/// Visible text of an image-only message with one image.
pub const ANALYZE_IMAGE_LABEL: &str = "Analyze this image";

/// Visible text of an image-only message with several images.
pub const ANALYZE_IMAGES_LABEL: &str = "Analyze these images";

/// Prompt sent for an image-only message with one image.
pub const DESCRIBE_IMAGE_PROMPT: &str = "Please describe and analyze this image in detail.";

/// Prompt sent for an image-only message with several images.
pub const DESCRIBE_IMAGES_PROMPT: &str = "Please analyze these images and describe what you see.";

/// Built-in instruction applied to the page or its selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuickAction {
    Summarize,
    Explain,
    Translate,
}

impl QuickAction {
    pub const ALL: [QuickAction; 3] = [
        QuickAction::Summarize,
        QuickAction::Explain,
        QuickAction::Translate,
    ];

    /// Context-menu item id for this action.
    pub fn menu_id(self) -> &'static str {
        match self {
            QuickAction::Summarize => "ai-summarize",
            QuickAction::Explain => "ai-explain",
            QuickAction::Translate => "ai-translate",
        }
    }

    /// Parse a context-menu item id.
    pub fn from_menu_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.menu_id() == id)
    }
}

/// Prompt for a quick action run from the sidebar.
///
/// Returns `None` when the action needs a selection and the page has none.
pub fn quick_action_prompt(action: QuickAction, page: &PageContent) -> Option<String> {
    match action {
        QuickAction::Summarize => Some(format!(
            "Please provide a concise summary of the following webpage content. \
             Focus on the main points and key information.\n\n\
             Page Title: {}\nURL: {}\n\nContent:\n{}",
            page.title, page.url, page.content
        )),
        QuickAction::Explain => page.selection().map(|text| {
            format!(
                "Please explain the following selected text in simple, easy-to-understand terms. \
                 Break it down step by step if needed:\n\n\"{text}\""
            )
        }),
        QuickAction::Translate => page.selection().map(|text| {
            format!(
                "Please translate the following text. If it's in English, translate to Chinese. \
                 If it's in another language, translate to English. Provide both the translation \
                 and a brief explanation of the meaning:\n\n\"{text}\""
            )
        }),
    }
}

/// Prompt for an action picked from the page's context menu.
pub fn context_menu_prompt(action: QuickAction, text: &str) -> String {
    match action {
        QuickAction::Explain => {
            format!("Please explain the following text in simple terms:\n\n\"{text}\"")
        }
        QuickAction::Summarize => format!("Please summarize the following text:\n\n\"{text}\""),
        QuickAction::Translate => format!(
            "Please translate the following text to English \
             (or if it's already in English, translate to Chinese):\n\n\"{text}\""
        ),
    }
}

/// Visible message text and API prompt for an image-only send.
pub fn image_only_prompts(image_count: usize) -> (&'static str, &'static str) {
    if image_count > 1 {
        (ANALYZE_IMAGES_LABEL, DESCRIBE_IMAGES_PROMPT)
    } else {
        (ANALYZE_IMAGE_LABEL, DESCRIBE_IMAGE_PROMPT)
    }
}
