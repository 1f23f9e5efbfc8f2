//! Canonical request/response model and wire-dialect parsing
//!
//! Both recognized dialects (Anthropic Messages, OpenAI Chat Completions)
//! are normalized into [`ProxyRequest`]. Unknown JSON fields are preserved
//! in flattened extra bags and re-emitted intact when the body is
//! serialized back for the upstream.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::ApiFormat;
use crate::error::{ProxyError, ProxyResult};
use crate::pricing::estimate_tokens;

/// One content block of a message or system prompt.
///
/// Only the fields the pipeline manipulates are typed; everything else
/// rides along in `extra` and round-trips untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock {
            block_type: "text".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Message content: plain text or an ordered block sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Flat text view: the string itself, or all text blocks joined by
    /// newlines.
    pub fn flat_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

impl Serialize for MessageContent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageContent::Text(s) => serializer.serialize_str(s),
            MessageContent::Blocks(blocks) => blocks.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Null => Ok(MessageContent::Text(String::new())),
            Value::String(s) => Ok(MessageContent::Text(s)),
            Value::Array(items) => {
                let blocks = items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<ContentBlock>, _>>()
                    .map_err(serde::de::Error::custom)?;
                Ok(MessageContent::Blocks(blocks))
            }
            other => Err(serde::de::Error::custom(format!(
                "message content must be string, array or null, got {}",
                other
            ))),
        }
    }
}

/// One chat message in either dialect.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: role.into(),
            content: MessageContent::Text(content.into()),
            ..Default::default()
        }
    }

    /// True when the message carries a tool invocation, either as a
    /// `tool_use` content block or as `tool_calls`.
    pub fn has_tool_invocation(&self) -> bool {
        if self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty()) {
            return true;
        }
        matches!(&self.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| b.block_type == "tool_use"))
    }
}

/// A tool definition carried by the request. The raw JSON is kept for
/// fingerprinting and re-emission; `name`/`description` are extracted for
/// convenience.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub raw: Value,
}

impl ToolDef {
    fn from_value(format: ApiFormat, raw: Value) -> Self {
        let obj = match format {
            ApiFormat::Anthropic => Some(&raw),
            ApiFormat::OpenAI => raw.get("function").or(Some(&raw)),
        };
        let name = obj
            .and_then(|o| o.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let description = obj
            .and_then(|o| o.get("description"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        ToolDef {
            name,
            description,
            raw,
        }
    }

    /// Canonical JSON for fingerprinting, falling back to
    /// `name:description` if serialization fails.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.raw)
            .unwrap_or_else(|_| format!("{}:{}", self.name, self.description))
    }
}

/// Normalized inbound request, mutated in place by the pipeline.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub format: ApiFormat,
    pub model: String,
    pub messages: Vec<Message>,
    /// Flat system prompt text (joined when the wire form is structured).
    pub system: String,
    /// Structured system blocks, Anthropic-shaped. Empty unless the client
    /// sent an array or a middleware synthesized one.
    pub system_blocks: Vec<ContentBlock>,
    pub tools: Vec<ToolDef>,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub raw_body: Vec<u8>,
    pub tokens_in: i64,
    pub metadata: HashMap<String, Value>,
    pub flags: HashMap<String, bool>,
    /// Original client headers (lowercased names), minus hop-by-hop ones.
    pub headers: HashMap<String, String>,
}

impl ProxyRequest {
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.flags.insert(name.to_string(), value);
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// Count of `role == "user"` messages.
    pub fn user_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == "user").count()
    }
}

/// Response assembled for one request, mutated by the reverse pipeline.
#[derive(Debug, Clone, Default)]
pub struct ProxyResponse {
    pub request_id: String,
    pub status_code: u16,
    pub model: String,
    pub tokens_out: i64,
    pub tokens_cached: i64,
    pub tokens_saved: i64,
    pub streaming: bool,
    pub body: Vec<u8>,
    pub cost_usd: f64,
    pub savings_usd: f64,
    pub latency: Duration,
    pub cache_hit: bool,
    pub request_type: String,
    pub provider: String,
    pub error: Option<String>,
    pub flags: HashMap<String, bool>,
}

/// Pre-built response used to short-circuit the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    pub status_code: u16,
    pub content_type: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl CachedResponse {
    pub fn json(body: Vec<u8>) -> Self {
        CachedResponse {
            body,
            status_code: 200,
            content_type: "application/json".to_string(),
            headers: Vec::new(),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Map a URL path onto a wire dialect.
pub fn format_for_path(path: &str) -> ProxyResult<ApiFormat> {
    match path {
        "/v1/messages" => Ok(ApiFormat::Anthropic),
        "/v1/chat/completions" => Ok(ApiFormat::OpenAI),
        other => Err(ProxyError::UnsupportedEndpoint(other.to_string())),
    }
}

fn boolish(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        Value::String(raw) => {
            let normalized = raw.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    }
}

/// Parse a raw request body for the dialect implied by `path`.
pub fn parse(
    path: &str,
    body: &[u8],
    headers: HashMap<String, String>,
) -> ProxyResult<ProxyRequest> {
    let format = format_for_path(path)?;
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::MalformedBody(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProxyError::MalformedBody("request body must be a JSON object".to_string()))?;

    let model = obj
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let messages: Vec<Message> = match obj.get("messages") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| ProxyError::MalformedBody(format!("invalid messages: {}", e)))?,
        None => Vec::new(),
    };

    let mut system = String::new();
    let mut system_blocks = Vec::new();
    match format {
        ApiFormat::Anthropic => match obj.get("system") {
            Some(Value::String(s)) => system = s.clone(),
            Some(Value::Array(items)) => {
                system_blocks = items
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<ContentBlock>, _>>()
                    .map_err(|e| ProxyError::MalformedBody(format!("invalid system blocks: {}", e)))?;
                system = system_blocks
                    .iter()
                    .filter(|b| b.block_type == "text")
                    .filter_map(|b| b.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(ProxyError::MalformedBody(format!(
                    "system must be string or array, got {}",
                    other
                )))
            }
        },
        ApiFormat::OpenAI => {
            // System messages stay in `messages` for forwarding; the flat
            // view joins them for the middlewares.
            system = messages
                .iter()
                .filter(|m| m.role == "system")
                .map(|m| m.content.flat_text())
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    let tools = obj
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .cloned()
                .map(|raw| ToolDef::from_value(format, raw))
                .collect()
        })
        .unwrap_or_default();

    let stream = obj.get("stream").map(boolish).unwrap_or(false);
    let max_tokens = obj.get("max_tokens").and_then(|v| v.as_u64());
    let temperature = obj.get("temperature").and_then(|v| v.as_f64());

    let tokens_in = {
        let mut text = system.clone();
        for message in &messages {
            text.push_str(&message.content.flat_text());
        }
        estimate_tokens(&text)
    };

    Ok(ProxyRequest {
        id: Uuid::new_v4().to_string(),
        received_at: Utc::now(),
        format,
        model,
        messages,
        system,
        system_blocks,
        tools,
        stream,
        max_tokens,
        temperature,
        raw_body: body.to_vec(),
        tokens_in,
        metadata: HashMap::new(),
        flags: HashMap::new(),
        headers,
    })
}

// ============================================================================
// Outbound serialization
// ============================================================================

/// Rebuild the wire body for the upstream from the (possibly rewritten)
/// request. Fields the pipeline never touches are carried over from the
/// original body verbatim.
pub fn to_outbound_body(req: &ProxyRequest) -> ProxyResult<Vec<u8>> {
    let value: Value = serde_json::from_slice(&req.raw_body)
        .map_err(|e| ProxyError::MalformedBody(e.to_string()))?;
    let mut obj = match value {
        Value::Object(obj) => obj,
        _ => Map::new(),
    };

    if !req.model.is_empty() {
        obj.insert("model".to_string(), Value::String(req.model.clone()));
    }
    obj.insert(
        "messages".to_string(),
        serde_json::to_value(&req.messages)
            .map_err(|e| ProxyError::MalformedBody(e.to_string()))?,
    );

    match req.format {
        ApiFormat::Anthropic => {
            if !req.system_blocks.is_empty() {
                obj.insert(
                    "system".to_string(),
                    serde_json::to_value(&req.system_blocks)
                        .map_err(|e| ProxyError::MalformedBody(e.to_string()))?,
                );
            } else if !req.system.is_empty() {
                obj.insert("system".to_string(), Value::String(req.system.clone()));
            } else {
                obj.remove("system");
            }
        }
        ApiFormat::OpenAI => {
            // System prompt travels inside `messages` for this dialect.
        }
    }

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|tool| {
                let mut raw = tool.raw.clone();
                // Dedup marks repeat tools for provider-side caching; the
                // annotation goes on the tool object for Anthropic only.
                let marked = req.flag(&format!("cache_tool_{}", tool.name))
                    || req
                        .metadata
                        .get(&format!("cache_tool_{}", tool.name))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                if marked && req.format == ApiFormat::Anthropic {
                    if let Some(tool_obj) = raw.as_object_mut() {
                        tool_obj.entry("cache_control".to_string()).or_insert_with(
                            || serde_json::json!({"type": "ephemeral"}),
                        );
                    }
                }
                raw
            })
            .collect();
        obj.insert("tools".to_string(), Value::Array(tools));
    }

    serde_json::to_vec(&Value::Object(obj)).map_err(|e| ProxyError::MalformedBody(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn rejects_unknown_path() {
        let err = parse("/v2/other", b"{}", no_headers()).unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedEndpoint(_)));
    }

    #[test]
    fn rejects_invalid_json() {
        let err = parse("/v1/messages", b"not json", no_headers()).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedBody(_)));
    }

    #[test]
    fn anthropic_plain_system() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "system": "You are helpful.",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        });
        let req = parse("/v1/messages", &serde_json::to_vec(&body).unwrap(), no_headers()).unwrap();
        assert_eq!(req.format, ApiFormat::Anthropic);
        assert_eq!(req.system, "You are helpful.");
        assert!(req.system_blocks.is_empty());
        assert!(req.stream);
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn anthropic_system_blocks_join() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "system": [
                {"type": "text", "text": "Line one."},
                {"type": "text", "text": "Line two."}
            ],
            "messages": []
        });
        let req = parse("/v1/messages", &serde_json::to_vec(&body).unwrap(), no_headers()).unwrap();
        assert_eq!(req.system, "Line one.\nLine two.");
        assert_eq!(req.system_blocks.len(), 2);
    }

    #[test]
    fn openai_system_messages_join_and_remain() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be helpful."},
                {"role": "user", "content": "hello"},
                {"role": "system", "content": "Be concise."}
            ]
        });
        let req = parse(
            "/v1/chat/completions",
            &serde_json::to_vec(&body).unwrap(),
            no_headers(),
        )
        .unwrap();
        assert_eq!(req.system, "Be helpful.\nBe concise.");
        assert_eq!(req.messages.len(), 3);
    }

    #[test]
    fn null_content_treated_as_empty() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "assistant", "content": null, "tool_calls": [{"id": "x"}]}]
        });
        let req = parse(
            "/v1/chat/completions",
            &serde_json::to_vec(&body).unwrap(),
            no_headers(),
        )
        .unwrap();
        assert!(req.messages[0].content.is_empty());
        assert!(req.messages[0].has_tool_invocation());
    }

    #[test]
    fn unknown_block_fields_roundtrip() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{
                "role": "user",
                "content": [{"type": "text", "text": "hi", "custom_field": {"a": 1}}]
            }]
        });
        let mut req =
            parse("/v1/messages", &serde_json::to_vec(&body).unwrap(), no_headers()).unwrap();
        // force re-serialization through the typed model
        req.model = "claude-3-haiku".to_string();
        let out = to_outbound_body(&req).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            value["messages"][0]["content"][0]["custom_field"]["a"],
            Value::from(1)
        );
        assert_eq!(value["model"], "claude-3-haiku");
    }

    #[test]
    fn outbound_keeps_untouched_fields() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 256,
            "metadata": {"user_id": "u-1"}
        });
        let req = parse("/v1/messages", &serde_json::to_vec(&body).unwrap(), no_headers()).unwrap();
        let out = to_outbound_body(&req).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["max_tokens"], 256);
        assert_eq!(value["metadata"]["user_id"], "u-1");
    }

    #[test]
    fn cache_marked_tool_gets_annotated() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [],
            "tools": [{"name": "search", "description": "Search things", "input_schema": {}}]
        });
        let mut req =
            parse("/v1/messages", &serde_json::to_vec(&body).unwrap(), no_headers()).unwrap();
        req.metadata
            .insert("cache_tool_search".to_string(), Value::Bool(true));
        let out = to_outbound_body(&req).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["tools"][0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn openai_tool_names_come_from_function() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [],
            "tools": [{"type": "function", "function": {"name": "lookup", "description": "d"}}]
        });
        let req = parse(
            "/v1/chat/completions",
            &serde_json::to_vec(&body).unwrap(),
            no_headers(),
        )
        .unwrap();
        assert_eq!(req.tools[0].name, "lookup");
    }
}
