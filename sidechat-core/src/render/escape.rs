//! HTML escaping for model output.

/// Replace `&`, `<` and `>` with their entity equivalents.
///
/// Must run exactly once, before any markdown pass: every tag the renderer
/// emits afterwards is trusted markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}
