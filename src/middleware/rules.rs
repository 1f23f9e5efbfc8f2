//! Rules middleware
//!
//! Text-level compressions applied to the system prompt and message
//! content: whitespace collapsing, JSON/XML minification, markdown
//! stripping and cross-message instruction dedup. Fenced and indented
//! code is never altered by the whitespace rules.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::RulesConfig;
use crate::error::ProxyResult;
use crate::proxy::context::RequestContext;
use crate::proxy::request::{MessageContent, ProxyRequest, ProxyResponse};

static RE_WS_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\S\n]+").unwrap());
static RE_TRAILING_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)[ \t]+$").unwrap());
static RE_NEWLINE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_JSON_REGION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{(?:[^{}]|\{[^{}]*\})*\}|\[(?:[^\[\]]|\[[^\[\]]*\])*\]").unwrap()
});
static RE_XML_BETWEEN_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r">\s+<").unwrap());
static RE_XML_AFTER_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r">\s+([^<\s])").unwrap());
static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static RE_BOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*|__([^_]+)__").unwrap());
static RE_STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~([^~]+)~~").unwrap());
static RE_INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
static RE_ITALIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*\n]+)\*|\b_([^_\n]+)_\b").unwrap());
static RE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());

/// Byte span that the whitespace rules must leave byte-identical.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Span {
    start: usize,
    end: usize,
}

/// Fenced code blocks and lines indented by four or more spaces, merged
/// where they overlap or touch.
fn protected_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut offset = 0;
    let mut fence_start: Option<usize> = None;
    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            match fence_start.take() {
                Some(start) => spans.push(Span {
                    start,
                    end: offset,
                }),
                None => fence_start = Some(line_start),
            }
            continue;
        }
        if fence_start.is_none() && line.starts_with("    ") {
            spans.push(Span {
                start: line_start,
                end: offset,
            });
        }
    }
    // unterminated fence protects through the end of the text
    if let Some(start) = fence_start {
        spans.push(Span {
            start,
            end: text.len(),
        });
    }

    spans.sort_by_key(|s| s.start);
    let mut merged: Vec<Span> = Vec::new();
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

fn collapse_segment(segment: &str) -> String {
    let out = RE_WS_RUN.replace_all(segment, " ");
    let out = RE_TRAILING_WS.replace_all(&out, "");
    RE_NEWLINE_RUN.replace_all(&out, "\n\n").into_owned()
}

/// Collapse whitespace outside protected spans.
pub fn collapse_whitespace(text: &str) -> String {
    let spans = protected_spans(text);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in &spans {
        if cursor < span.start {
            out.push_str(&collapse_segment(&text[cursor..span.start]));
        }
        out.push_str(&text[span.start..span.end]);
        cursor = span.end;
    }
    if cursor < text.len() {
        out.push_str(&collapse_segment(&text[cursor..]));
    }
    out
}

/// Re-emit parseable `{…}`/`[…]` regions compactly; anything that fails to
/// parse is left exactly as found.
pub fn minify_json(text: &str) -> String {
    RE_JSON_REGION
        .replace_all(text, |caps: &regex::Captures| {
            let region = &caps[0];
            match serde_json::from_str::<Value>(region) {
                Ok(value) => serde_json::to_string(&value).unwrap_or_else(|_| region.to_string()),
                Err(_) => region.to_string(),
            }
        })
        .into_owned()
}

/// Collapse whitespace between adjacent tags, keeping a single space when
/// text follows a tag. Only applied to text that looks like markup.
pub fn minify_xml(text: &str) -> String {
    if !text.contains('<') || !text.contains('>') {
        return text.to_string();
    }
    let out = RE_XML_BETWEEN_TAGS.replace_all(text, "><");
    RE_XML_AFTER_TAG.replace_all(&out, "> $1").into_owned()
}

/// Strip markdown decoration. Fenced code blocks are cut out first and
/// restored verbatim afterwards.
pub fn strip_markdown(text: &str) -> String {
    let mut blocks = Vec::new();
    let protected = RE_FENCE
        .replace_all(text, |caps: &regex::Captures| {
            let marker = format!("\u{1}CODE{}\u{1}", blocks.len());
            blocks.push(caps[0].to_string());
            marker
        })
        .into_owned();

    let out = RE_HEADING.replace_all(&protected, "");
    let out = RE_BOLD.replace_all(&out, "$1$2");
    let out = RE_STRIKE.replace_all(&out, "$1");
    let out = RE_INLINE_CODE.replace_all(&out, "$1");
    let mut out = RE_ITALIC.replace_all(&out, "$1$2").into_owned();

    for (i, block) in blocks.iter().enumerate() {
        out = out.replace(&format!("\u{1}CODE{}\u{1}", i), block);
    }
    out
}

pub struct RulesMiddleware {
    config: RulesConfig,
}

impl RulesMiddleware {
    pub fn new(config: RulesConfig) -> Self {
        RulesMiddleware { config }
    }

    pub fn name(&self) -> &'static str {
        "rules"
    }

    pub fn enabled(&self) -> bool {
        self.config.any_enabled()
    }

    fn apply_text_rules(&self, text: &str) -> String {
        let mut out = text.to_string();
        if self.config.collapse_whitespace {
            out = collapse_whitespace(&out);
        }
        if self.config.minify_json {
            out = minify_json(&out);
        }
        if self.config.minify_xml {
            out = minify_xml(&out);
        }
        if self.config.strip_markdown {
            out = strip_markdown(&out);
        }
        out
    }

    fn apply_to_request(&self, req: &mut ProxyRequest) {
        if !req.system.is_empty() {
            req.system = self.apply_text_rules(&req.system);
        }
        for block in &mut req.system_blocks {
            if let Some(text) = block.text.take() {
                block.text = Some(self.apply_text_rules(&text));
            }
        }
        for message in &mut req.messages {
            match &mut message.content {
                MessageContent::Text(text) => {
                    *text = self.apply_text_rules(text);
                }
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        if block.block_type == "text" {
                            if let Some(text) = block.text.take() {
                                block.text = Some(self.apply_text_rules(&text));
                            }
                        }
                    }
                }
            }
        }

        if self.config.dedup_instructions {
            self.dedup_instructions(req);
        }
    }

    /// Replace repeated long instruction texts by a back-reference to the
    /// first occurrence. String content and text-typed blocks both
    /// participate; texts under 80 characters never do.
    fn dedup_instructions(&self, req: &mut ProxyRequest) {
        fn dedup_one(text: &mut String, idx: usize, seen: &mut Vec<(String, usize)>) {
            if text.len() < 80 {
                return;
            }
            match seen.iter().find(|(t, _)| t == text) {
                Some((_, first)) => {
                    *text = format!("[See instructions above (message {})]", first + 1);
                }
                None => seen.push((text.clone(), idx)),
            }
        }

        let mut seen: Vec<(String, usize)> = Vec::new();
        for (idx, message) in req.messages.iter_mut().enumerate() {
            match &mut message.content {
                MessageContent::Text(text) => dedup_one(text, idx, &mut seen),
                MessageContent::Blocks(blocks) => {
                    for block in blocks.iter_mut().filter(|b| b.block_type == "text") {
                        if let Some(text) = block.text.as_mut() {
                            dedup_one(text, idx, &mut seen);
                        }
                    }
                }
            }
        }
    }

    pub async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        let before: usize = req.system.len()
            + req
                .messages
                .iter()
                .map(|m| m.content.flat_text().len())
                .sum::<usize>();

        self.apply_to_request(req);

        let after: usize = req.system.len()
            + req
                .messages
                .iter()
                .map(|m| m.content.flat_text().len())
                .sum::<usize>();

        if after < before {
            let saved = (((before - after) as i64) / 4).max(1);
            req.metadata
                .insert("rules_tokens_saved".to_string(), Value::from(saved));
            req.set_flag("rules_tokens_saved", true);
        }
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
