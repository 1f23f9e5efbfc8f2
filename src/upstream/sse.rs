//! Server-sent event parsing and delta accumulation
//!
//! Parses the upstream byte stream into SSE events for verbatim
//! re-emission to the client, while accumulating dialect-specific text
//! deltas so the final response body and token counts can be recorded.

use serde_json::Value;

use crate::config::ApiFormat;

/// One complete SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// The original event text including its terminating blank line,
    /// re-emitted to the client unchanged.
    pub raw: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE parser over a chunked byte stream. Line breaks may
/// split across reads; `push` returns every event completed so far.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    raw_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser::default()
    }

    fn take_event(&mut self) -> Option<SseEvent> {
        if self.raw_lines.is_empty() {
            return None;
        }
        let mut raw = self.raw_lines.join("\n");
        raw.push_str("\n\n");
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
            raw,
        };
        self.data.clear();
        self.raw_lines.clear();
        Some(event)
    }

    fn handle_line(&mut self, line: String) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take_event();
        }
        // comment line
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_str(), ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        self.raw_lines.push(line.clone());
        None
    }

    /// Feed a chunk; returns the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.handle_line(line) {
                events.push(event);
            }
        }
        events
    }
}

/// Accumulates dialect-specific text deltas for the final response body.
/// Once the byte cap is exceeded, further appends are dropped while
/// events continue to flow to the client.
#[derive(Debug)]
pub struct DeltaAccumulator {
    format: ApiFormat,
    pub model: String,
    pub output_tokens: i64,
    text: String,
    cap: usize,
    capped: bool,
}

impl DeltaAccumulator {
    /// `cap` of zero means unlimited.
    pub fn new(format: ApiFormat, cap: usize) -> Self {
        DeltaAccumulator {
            format,
            model: String::new(),
            output_tokens: 0,
            text: String::new(),
            cap,
            capped: false,
        }
    }

    fn append(&mut self, delta: &str) {
        if self.capped {
            return;
        }
        if self.cap > 0 && self.text.len() + delta.len() > self.cap {
            self.capped = true;
            return;
        }
        self.text.push_str(delta);
    }

    /// Ingest one event's data payload (never `[DONE]`).
    pub fn ingest(&mut self, data: &str) {
        let Ok(json) = serde_json::from_str::<Value>(data) else {
            return;
        };
        match self.format {
            ApiFormat::Anthropic => match json.get("type").and_then(|t| t.as_str()) {
                Some("message_start") => {
                    if let Some(model) = json
                        .get("message")
                        .and_then(|m| m.get("model"))
                        .and_then(|m| m.as_str())
                    {
                        self.model = model.to_string();
                    }
                }
                Some("content_block_delta") => {
                    if let Some(delta) = json.get("delta") {
                        if delta.get("type").and_then(|t| t.as_str()) == Some("text_delta") {
                            if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                                self.append(text);
                            }
                        }
                    }
                }
                Some("message_delta") => {
                    if let Some(tokens) = json
                        .get("usage")
                        .and_then(|u| u.get("output_tokens"))
                        .and_then(|t| t.as_i64())
                    {
                        self.output_tokens = tokens;
                    }
                }
                _ => {}
            },
            ApiFormat::OpenAI => {
                if let Some(model) = json.get("model").and_then(|m| m.as_str()) {
                    self.model = model.to_string();
                }
                if let Some(content) = json
                    .get("choices")
                    .and_then(|c| c.as_array())
                    .and_then(|c| c.first())
                    .and_then(|c| c.get("delta"))
                    .and_then(|d| d.get("content"))
                    .and_then(|c| c.as_str())
                {
                    self.append(content);
                }
                if let Some(tokens) = json
                    .get("usage")
                    .and_then(|u| u.get("completion_tokens"))
                    .and_then(|t| t.as_i64())
                {
                    self.output_tokens = tokens;
                }
            }
        }
    }

    pub fn was_capped(&self) -> bool {
        self.capped
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_lines_and_blank_terminator() {
        let mut parser = SseParser::new();
        let events = parser.push(b"event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[0].raw.ends_with("\n\n"));
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: line one\ndata: line two\n\n");
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn comments_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
        assert!(!events[0].raw.contains("keep-alive"));
    }

    #[test]
    fn chunks_split_mid_line_are_reassembled() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: par").is_empty());
        assert!(parser.push(b"tial\n").is_empty());
        let events = parser.push(b"\n");
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: ok\r\n\r\n");
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn no_space_after_colon_is_fine() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data:tight\n\n");
        assert_eq!(events[0].data, "tight");
    }

    #[test]
    fn anthropic_accumulation() {
        let mut acc = DeltaAccumulator::new(ApiFormat::Anthropic, 0);
        acc.ingest(
            r#"{"type":"message_start","message":{"model":"claude-sonnet-4-20250514","usage":{"input_tokens":10}}}"#,
        );
        acc.ingest(r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#);
        acc.ingest(r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":" World"}}"#);
        acc.ingest(r#"{"type":"message_delta","usage":{"output_tokens":12}}"#);
        assert_eq!(acc.model, "claude-sonnet-4-20250514");
        assert_eq!(acc.output_tokens, 12);
        assert_eq!(acc.into_text(), "Hello World");
    }

    #[test]
    fn openai_accumulation() {
        let mut acc = DeltaAccumulator::new(ApiFormat::OpenAI, 0);
        acc.ingest(r#"{"model":"gpt-4o","choices":[{"delta":{"content":"Hi"}}]}"#);
        acc.ingest(r#"{"model":"gpt-4o","choices":[{"delta":{"content":" there"}}]}"#);
        assert_eq!(acc.model, "gpt-4o");
        assert_eq!(acc.into_text(), "Hi there");
    }

    #[test]
    fn non_text_deltas_are_ignored() {
        let mut acc = DeltaAccumulator::new(ApiFormat::Anthropic, 0);
        acc.ingest(
            r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
        );
        assert_eq!(acc.text(), "");
    }

    #[test]
    fn accumulator_cap_stops_appends_only() {
        let mut acc = DeltaAccumulator::new(ApiFormat::OpenAI, 8);
        acc.ingest(r#"{"choices":[{"delta":{"content":"12345678"}}]}"#);
        acc.ingest(r#"{"choices":[{"delta":{"content":"more"}}]}"#);
        assert!(acc.was_capped());
        assert_eq!(acc.into_text(), "12345678");
    }

    #[test]
    fn malformed_json_is_ignored() {
        let mut acc = DeltaAccumulator::new(ApiFormat::OpenAI, 0);
        acc.ingest("not json");
        assert_eq!(acc.text(), "");
    }
}
