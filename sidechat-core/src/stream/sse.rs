//! Decoder for the chat-completions event stream.
//!
//! The body is a sequence of `data: <json>` lines ending with `data: [DONE]`.
//! Network chunks split lines at arbitrary byte offsets, so bytes are buffered
//! until a full line is available.

use serde_json::Value;

/// Prefix of every payload line.
const DATA_PREFIX: &str = "data: ";

/// End-of-stream sentinel payload.
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental line decoder turning raw body chunks into text deltas.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk. Returns the deltas of every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            if let Some(delta) = parse_line(&text) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush a final line that arrived without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&line))
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Extract the text delta carried by one event line.
///
/// Returns `None` for non-data lines, the sentinel, malformed envelopes and
/// empty deltas.
pub fn parse_line(line: &str) -> Option<String> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let data = line.strip_prefix(DATA_PREFIX)?;
    if data == DONE_SENTINEL {
        return None;
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::trace!(error = %e, "Skipping malformed stream frame");
            return None;
        }
    };

    let content = value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()?;

    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(content: &str) -> String {
        format!(
            "data: {}\n",
            serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
        )
    }

    #[test]
    fn test_decodes_complete_frames() {
        let mut decoder = SseDecoder::new();
        let body = format!("{}{}data: [DONE]\n", frame("Hel"), frame("lo"));
        assert_eq!(decoder.push(body.as_bytes()), vec!["Hel", "lo"]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_reassembles_frame_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let body = frame("split");
        let (a, b) = body.as_bytes().split_at(17);

        assert!(decoder.push(a).is_empty());
        assert!(decoder.pending_len() > 0);
        assert_eq!(decoder.push(b), vec!["split"]);
    }

    #[test]
    fn test_reassembles_multibyte_character_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let body = frame("héllo");
        let bytes = body.as_bytes();
        let cut = body.find('é').unwrap() + 1;

        assert!(decoder.push(&bytes[..cut]).is_empty());
        assert_eq!(decoder.push(&bytes[cut..]), vec!["héllo"]);
    }

    #[test]
    fn test_skips_noise() {
        let mut decoder = SseDecoder::new();
        let body = concat!(
            ": keep-alive\n",
            "\n",
            "data: {not json}\n",
            "data: {\"choices\":[]}\n",
            "data: {\"choices\":[{\"delta\":{}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n",
            "event: ping\n",
            "data: [DONE]\n",
        );
        assert!(decoder.push(body.as_bytes()).is_empty());
    }

    #[test]
    fn test_handles_crlf_line_endings() {
        assert_eq!(
            parse_line("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r").as_deref(),
            Some("x")
        );
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        let body = frame("tail");
        assert!(decoder.push(body.trim_end().as_bytes()).is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail"));
        assert_eq!(decoder.finish(), None);
    }
}
