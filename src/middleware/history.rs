//! History middleware
//!
//! Replaces conversation messages older than the configured window with a
//! compact summary marker and truncates oversized tool outputs inside the
//! kept window.

use serde_json::Value;

use crate::config::{ApiFormat, HistoryConfig};
use crate::error::ProxyResult;
use crate::proxy::context::RequestContext;
use crate::proxy::request::{Message, MessageContent, ProxyRequest, ProxyResponse};

/// Header that skips history compression for one request.
const NO_COMPRESS_HEADER: &str = "x-tokenman-nocompress";

const PREVIEW_LIMIT: usize = 50;
const TRUNCATE_THRESHOLD_LINES: usize = 200;
const TRUNCATE_KEEP_LINES: usize = 100;

pub struct HistoryMiddleware {
    config: HistoryConfig,
}

impl HistoryMiddleware {
    pub fn new(config: HistoryConfig) -> Self {
        HistoryMiddleware { config }
    }

    pub fn name(&self) -> &'static str {
        "history"
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// First ≤50 chars of text from the removed prefix: the first user
    /// message preferred, any non-empty text as fallback.
    fn preview(removed: &[Message]) -> String {
        let text = removed
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.flat_text())
            .filter(|t| !t.is_empty())
            .or_else(|| {
                removed
                    .iter()
                    .map(|m| m.content.flat_text())
                    .find(|t| !t.is_empty())
            });
        match text {
            Some(text) => {
                let chars: Vec<char> = text.chars().collect();
                if chars.len() > PREVIEW_LIMIT {
                    format!("{}...", chars[..PREVIEW_LIMIT].iter().collect::<String>())
                } else {
                    text
                }
            }
            None => "(no text content)".to_string(),
        }
    }

    fn truncate_lines(text: &str) -> Option<String> {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() <= TRUNCATE_THRESHOLD_LINES {
            return None;
        }
        let omitted = lines.len() - 2 * TRUNCATE_KEEP_LINES;
        let mut out = Vec::with_capacity(2 * TRUNCATE_KEEP_LINES + 1);
        out.extend_from_slice(&lines[..TRUNCATE_KEEP_LINES]);
        let notice = format!("[...truncated {} lines...]", omitted);
        out.push(&notice);
        out.extend_from_slice(&lines[lines.len() - TRUNCATE_KEEP_LINES..]);
        Some(out.join("\n"))
    }

    fn truncate_tool_outputs(message: &mut Message) {
        let MessageContent::Blocks(blocks) = &mut message.content else {
            return;
        };
        for block in blocks {
            if block.block_type != "tool_result" && block.block_type != "tool" {
                continue;
            }
            if let Some(text) = block.text.as_deref() {
                if let Some(shortened) = Self::truncate_lines(text) {
                    block.text = Some(shortened);
                }
            }
            if let Some(Value::String(text)) = &block.content {
                if let Some(shortened) = Self::truncate_lines(text) {
                    block.content = Some(Value::String(shortened));
                }
            }
        }
    }

    fn estimate_message_tokens(messages: &[Message]) -> i64 {
        let chars: usize = messages
            .iter()
            .map(|m| m.content.flat_text().chars().count())
            .sum();
        (chars as i64) / 4
    }

    pub async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        if req.header(NO_COMPRESS_HEADER).is_some() {
            return Ok(());
        }
        if req.messages.len() <= self.config.window_size {
            return Ok(());
        }

        let original_messages = req.messages.len();
        let original_tokens = Self::estimate_message_tokens(&req.messages);
        let cutoff = req.messages.len() - self.config.window_size;

        let removed: Vec<Message> = req.messages.drain(..cutoff).collect();
        let preview = Self::preview(&removed);
        let role = match req.format {
            ApiFormat::OpenAI => "system",
            ApiFormat::Anthropic => "user",
        };
        let summary = Message::new(
            role,
            format!(
                "[Compressed context from {} earlier messages]: {}",
                cutoff, preview
            ),
        );
        req.messages.insert(0, summary);

        for message in req.messages.iter_mut().skip(1) {
            Self::truncate_tool_outputs(message);
        }

        req.metadata.insert(
            "history_original_messages".to_string(),
            Value::from(original_messages),
        );
        req.metadata.insert(
            "history_compressed_messages".to_string(),
            Value::from(req.messages.len()),
        );
        req.metadata.insert(
            "history_original_tokens".to_string(),
            Value::from(original_tokens),
        );
        req.metadata.insert(
            "history_compressed_tokens".to_string(),
            Value::from(Self::estimate_message_tokens(&req.messages)),
        );

        tracing::debug!(
            target: "tokenman::history",
            original = original_messages,
            kept = req.messages.len(),
            "compressed conversation history"
        );
        Ok(())
    }

    pub async fn process_response(
        &self,
        _ctx: &mut RequestContext,
        _req: &ProxyRequest,
        _resp: &mut ProxyResponse,
    ) -> ProxyResult<()> {
        Ok(())
    }
}
