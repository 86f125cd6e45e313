//! Server-Sent Events encoding and decoding.
//!
//! A pure, no-I/O SSE codec. The Streamable HTTP service emits frames via
//! axum's SSE response type; this module exists for the wire-format contract
//! (and its tests), for the keepalive/priming frames, and for the parser the
//! test suites use to read streamed bodies back.
//!
//! An event is a run of `field: value` lines terminated by a blank line:
//!
//! ```text
//! event: message
//! id: 42
//! data: {"jsonrpc":"2.0", ...}
//!
//! ```

/// A decoded Server-Sent Event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    /// Event id for resumption support
    pub id: Option<String>,
    /// Event type; clients default it to `message`
    pub event: Option<String>,
    /// Event data, possibly multiline
    pub data: String,
}

impl SseEvent {
    /// A `message` event carrying a JSON payload.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: Some("message".to_string()),
            data: data.into(),
        }
    }

    /// Attach an event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Encode an event to its wire form.
pub fn encode(event: &SseEvent) -> String {
    let mut out = String::new();
    if let Some(ref id) = event.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(ref kind) = event.event {
        out.push_str("event: ");
        out.push_str(kind);
        out.push('\n');
    }
    if event.data.is_empty() {
        out.push_str("data:\n");
    } else {
        for line in event.data.lines() {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push('\n');
    out
}

/// Encode a comment frame; clients ignore it but it keeps connections alive.
pub fn encode_comment(comment: &str) -> String {
    format!(": {comment}\n\n")
}

/// Incremental SSE parser.
///
/// Feed raw chunks; complete events come out as they terminate. Used by the
/// HTTP tests to decode response bodies chunk by chunk.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning any events completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.finish_event() {
                    events.push(event);
                }
            } else if line.starts_with(':') {
                // comment
            } else if let Some((field, value)) = line.split_once(':') {
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "id" => self.id = Some(value.to_string()),
                    "event" => self.event = Some(value.to_string()),
                    "data" => self.data.push(value.to_string()),
                    _ => {}
                }
            }
        }
        events
    }

    fn finish_event(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.id.is_none() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_message_with_id() {
        let event = SseEvent::message("{\"a\":1}").with_id("7");
        assert_eq!(encode(&event), "id: 7\nevent: message\ndata: {\"a\":1}\n\n");
    }

    #[test]
    fn encode_empty_data_still_emits_a_data_line() {
        let event = SseEvent {
            id: None,
            event: Some("message".into()),
            data: String::new(),
        };
        assert_eq!(encode(&event), "event: message\ndata:\n\n");
    }

    #[test]
    fn comment_frames() {
        assert_eq!(encode_comment("keepalive"), ": keepalive\n\n");
    }

    #[test]
    fn parse_single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"id: 3\nevent: message\ndata: hello\n\n");
        assert_eq!(
            events,
            vec![SseEvent::message("hello").with_id("3")]
        );
    }

    #[test]
    fn parse_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: par").is_empty());
        assert!(parser.feed(b"tial\n").is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn parse_ignores_comments() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": ping\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn multiline_data_joined_with_newlines() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn roundtrip() {
        let original = SseEvent::message("line1\nline2").with_id("e-9");
        let mut parser = SseParser::new();
        let events = parser.feed(encode(&original).as_bytes());
        assert_eq!(events, vec![original]);
    }
}
