//! Rendering of chat text to HTML fragments.
//!
//! - `escape` - neutralizes markup characters before anything else runs
//! - `markdown` - the ordered markdown pass pipeline
//! - `RenderState` - caches the last render of a growing message

pub mod escape;
pub mod markdown;

pub use escape::escape_html;
pub use markdown::render_markdown;

/// Last rendered source and its HTML.
///
/// Streaming re-renders the whole accumulator on every delta; this skips the
/// work when nothing changed since the previous frame.
#[derive(Debug, Clone, Default)]
pub struct RenderState {
    source: String,
    html: String,
}

impl RenderState {
    /// Re-render if `content` differs from the last source. Returns the HTML.
    pub fn update(&mut self, content: &str) -> &str {
        if self.source != content {
            self.html = render_markdown(content);
            self.source.clear();
            self.source.push_str(content);
        }
        &self.html
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn clear(&mut self) {
        self.source.clear();
        self.html.clear();
    }
}
