//! Markdown to HTML rendering for chat messages.
//!
//! The renderer is a fixed sequence of passes over the escaped text. Order
//! matters: each pass sees the output of the one before it, and code spans are
//! set aside as soon as they are recognized so nothing later rewrites them.
//!
//! 1. fenced code blocks
//! 2. inline code
//! 3. pipe tables
//! 4. headers (`####` down to `#`)
//! 5. horizontal rules
//! 6. bold
//! 7. italic
//! 8. unordered lists
//! 9. ordered lists
//! 10. links
//! 11. line breaks
//! 12. break cleanup after block elements

use std::sync::LazyLock;

use regex::{Captures, Regex};

use super::escape::escape_html;

/// A pure text-to-text rewrite step.
pub type Pass = fn(&str) -> String;

/// Passes 3 through 11, in pipeline order.
pub const TEXT_PASSES: &[(&str, Pass)] = &[
    ("tables", tables),
    ("headers", headers),
    ("horizontal_rules", horizontal_rules),
    ("bold", bold),
    ("italic", italic),
    ("unordered_lists", unordered_lists),
    ("ordered_lists", ordered_lists),
    ("links", links),
    ("line_breaks", line_breaks),
];

macro_rules! regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("valid markdown regex"));
    };
}

regex!(FENCE_RE, r"(?s)```([A-Za-z0-9_+#.\-]*)\n(.*?)```");
regex!(INLINE_CODE_RE, r"`([^`\n]+)`");
regex!(
    TABLE_RE,
    r"(?m)^(\|.+\|)\n(\|[-:| ]+\|)\n(\|.+\|(?:\n\|.+\|)*)"
);
regex!(H4_RE, r"(?m)^#### (.+)$");
regex!(H3_RE, r"(?m)^### (.+)$");
regex!(H2_RE, r"(?m)^## (.+)$");
regex!(H1_RE, r"(?m)^# (.+)$");
regex!(HR_RE, r"(?m)^---$");
regex!(BOLD_RE, r"\*\*([^*]+)\*\*");
regex!(ITALIC_RE, r"\*([^*\s](?:[^*\n]*[^*\s])?)\*");
regex!(UL_ITEM_RE, r"(?m)^[-*] (.+)$");
regex!(
    UL_RUN_RE,
    r#"<li class="md-li">.*</li>(?:\n<li class="md-li">.*</li>)*"#
);
regex!(OL_ITEM_RE, r"(?m)^[0-9]+\. (.+)$");
regex!(
    OL_RUN_RE,
    r#"<li class="md-li-ordered">.*</li>(?:\n<li class="md-li-ordered">.*</li>)*"#
);
regex!(LINK_RE, r"\[([^\]]+)\]\(([^)]+)\)");
regex!(
    BLOCK_BREAK_RE,
    r#"(</pre>|</h[1-4]>|</ul>|</ol>|</li>|</table>|<hr class="md-hr">)<br>"#
);
regex!(SLOT_RE, r"<@(\d+)@>");

/// Render model output to an HTML fragment.
///
/// Total over all input: empty or whitespace-only text renders to `""`.
pub fn render_markdown(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }

    let mut protected = Protected::default();

    let escaped = escape_html(text);
    let fenced = fenced_code(&escaped, &mut protected);
    let mut html = inline_code(&fenced, &mut protected);

    for (_name, pass) in TEXT_PASSES {
        html = pass(&html);
    }

    let html = protected.restore(&html);
    cleanup_block_breaks(&html)
}

// =============================================================================
// Protected spans
// =============================================================================

/// Rendered code kept out of later passes.
///
/// Each span is replaced by a `<@N@>` placeholder. After escaping, `<` never
/// occurs in the working text, so a placeholder can't collide with input.
#[derive(Debug, Default)]
pub struct Protected {
    spans: Vec<String>,
}

impl Protected {
    fn stash(&mut self, html: String) -> String {
        let placeholder = format!("<@{}@>", self.spans.len());
        self.spans.push(html);
        placeholder
    }

    /// Put every stashed span back in place of its placeholder.
    pub fn restore(&self, text: &str) -> String {
        SLOT_RE
            .replace_all(text, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|idx| self.spans.get(idx))
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

// =============================================================================
// Passes
// =============================================================================

/// Pass 1: fenced code blocks, tagged with their language.
pub fn fenced_code(text: &str, protected: &mut Protected) -> String {
    FENCE_RE
        .replace_all(text, |caps: &Captures| {
            let lang = &caps[1];
            let class = if lang.is_empty() {
                "code-block".to_string()
            } else {
                format!("code-block language-{lang}")
            };
            protected.stash(format!(
                "<pre class=\"{class}\"><code>{}</code></pre>",
                caps[2].trim()
            ))
        })
        .into_owned()
}

/// Pass 2: single-backtick code spans on one line.
pub fn inline_code(text: &str, protected: &mut Protected) -> String {
    INLINE_CODE_RE
        .replace_all(text, |caps: &Captures| {
            protected.stash(format!("<code class=\"inline-code\">{}</code>", &caps[1]))
        })
        .into_owned()
}

/// Column alignment read from a table separator cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Center,
    Right,
}

impl Alignment {
    fn from_separator(cell: &str) -> Self {
        let cell = cell.trim();
        if cell.starts_with(':') && cell.ends_with(':') {
            Self::Center
        } else if cell.ends_with(':') {
            Self::Right
        } else {
            Self::Left
        }
    }

    fn as_css(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Center => "center",
            Self::Right => "right",
        }
    }
}

/// Split `| a | b |` into trimmed cells, dropping the outer edges.
fn split_row(row: &str) -> Vec<&str> {
    let parts: Vec<&str> = row.split('|').collect();
    if parts.len() < 2 {
        return Vec::new();
    }
    parts[1..parts.len() - 1].iter().map(|c| c.trim()).collect()
}

/// Pass 3: pipe tables (header row, separator row, body rows).
///
/// Rows with a different column count than the header are rendered as-is.
pub fn tables(text: &str) -> String {
    TABLE_RE
        .replace_all(text, |caps: &Captures| {
            let headers = split_row(&caps[1]);
            let alignments: Vec<Alignment> = split_row(&caps[2])
                .into_iter()
                .map(Alignment::from_separator)
                .collect();
            let align = |i: usize| {
                alignments
                    .get(i)
                    .copied()
                    .unwrap_or(Alignment::Left)
                    .as_css()
            };

            let mut html = String::from("<table class=\"md-table\"><thead><tr>");
            for (i, header) in headers.iter().enumerate() {
                html.push_str(&format!("<th style=\"text-align:{}\">{header}</th>", align(i)));
            }
            html.push_str("</tr></thead><tbody>");
            for row in caps[3].trim().split('\n') {
                html.push_str("<tr>");
                for (i, cell) in split_row(row).iter().enumerate() {
                    html.push_str(&format!("<td style=\"text-align:{}\">{cell}</td>", align(i)));
                }
                html.push_str("</tr>");
            }
            html.push_str("</tbody></table>");
            html
        })
        .into_owned()
}

/// Pass 4: ATX headers, longest prefix first.
pub fn headers(text: &str) -> String {
    let html = H4_RE.replace_all(text, "<h4 class=\"md-h4\">${1}</h4>");
    let html = H3_RE.replace_all(&html, "<h3 class=\"md-h3\">${1}</h3>");
    let html = H2_RE.replace_all(&html, "<h2 class=\"md-h2\">${1}</h2>");
    H1_RE
        .replace_all(&html, "<h1 class=\"md-h1\">${1}</h1>")
        .into_owned()
}

/// Pass 5: a line of exactly three hyphens.
pub fn horizontal_rules(text: &str) -> String {
    HR_RE
        .replace_all(text, "<hr class=\"md-hr\">")
        .into_owned()
}

/// Pass 6: `**bold**`.
pub fn bold(text: &str) -> String {
    BOLD_RE
        .replace_all(text, "<strong>${1}</strong>")
        .into_owned()
}

/// Pass 7: `*italic*`.
///
/// The span may not start or end with whitespace, which leaves `* item`
/// bullets for the list pass.
pub fn italic(text: &str) -> String {
    ITALIC_RE.replace_all(text, "<em>${1}</em>").into_owned()
}

/// Pass 8: `-`/`*` bullets, consecutive items wrapped in one `<ul>`.
pub fn unordered_lists(text: &str) -> String {
    let items = UL_ITEM_RE.replace_all(text, "<li class=\"md-li\">${1}</li>");
    UL_RUN_RE
        .replace_all(&items, "<ul class=\"md-ul\">${0}</ul>")
        .into_owned()
}

/// Pass 9: `1.` items, consecutive items wrapped in one `<ol>`.
pub fn ordered_lists(text: &str) -> String {
    let items = OL_ITEM_RE.replace_all(text, "<li class=\"md-li-ordered\">${1}</li>");
    OL_RUN_RE
        .replace_all(&items, "<ol class=\"md-ol\">${0}</ol>")
        .into_owned()
}

/// Pass 10: `[text](url)` anchors opening in a new tab without an opener.
///
/// A target holding a code placeholder renders the label only, since the
/// restored markup cannot live inside an attribute.
pub fn links(text: &str) -> String {
    LINK_RE
        .replace_all(text, |caps: &Captures| {
            let label = &caps[1];
            let url = &caps[2];
            if is_script_url(url) || SLOT_RE.is_match(url) {
                return label.to_string();
            }
            format!(
                "<a href=\"{}\" target=\"_blank\" rel=\"noopener\">{label}</a>",
                url.replace('"', "&quot;")
            )
        })
        .into_owned()
}

/// `javascript:`, `vbscript:` and `data:` targets, ignoring the whitespace
/// and control characters browsers strip from URLs.
fn is_script_url(url: &str) -> bool {
    let normalized: String = url
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_ascii_control())
        .collect::<String>()
        .to_ascii_lowercase();
    ["javascript:", "vbscript:", "data:"]
        .iter()
        .any(|scheme| normalized.starts_with(scheme))
}

/// Pass 11: every remaining newline becomes `<br>`.
pub fn line_breaks(text: &str) -> String {
    text.replace('\n', "<br>")
}

/// Pass 12: drop the break right after a block element's closing tag.
pub fn cleanup_block_breaks(html: &str) -> String {
    BLOCK_BREAK_RE.replace_all(html, "${1}").into_owned()
}

// =============================================================================
// Tests
// =============================================================================
