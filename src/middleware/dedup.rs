//! Dedup middleware
//!
//! Hashes static request content (system prompt, system blocks, tool
//! definitions) and tracks repeats through the fingerprint store. Content
//! repeated within the TTL is annotated so the upstream provider's own
//! prompt cache is triggered on the provider side.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{ApiFormat, DedupConfig};
use crate::error::ProxyResult;
use crate::pricing::estimate_tokens;
use crate::proxy::context::RequestContext;
use crate::proxy::request::{ContentBlock, ProxyRequest, ProxyResponse};
use crate::store::FingerprintStore;

/// SHA-256 hex digest of a string.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct DedupMiddleware {
    config: DedupConfig,
    store: Arc<dyn FingerprintStore>,
}

struct Unit {
    hash: String,
    content_type: &'static str,
    tokens: i64,
    tool_name: Option<String>,
}

impl DedupMiddleware {
    pub fn new(config: DedupConfig, store: Arc<dyn FingerprintStore>) -> Self {
        DedupMiddleware { config, store }
    }

    pub fn name(&self) -> &'static str {
        "dedup"
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn units(req: &ProxyRequest) -> Vec<Unit> {
        let mut units = Vec::new();
        if !req.system_blocks.is_empty() {
            for block in &req.system_blocks {
                if let Some(text) = block.text.as_deref() {
                    if !text.is_empty() {
                        units.push(Unit {
                            hash: sha256_hex(text),
                            content_type: "system_block",
                            tokens: estimate_tokens(text),
                            tool_name: None,
                        });
                    }
                }
            }
        } else if !req.system.is_empty() {
            units.push(Unit {
                hash: sha256_hex(&req.system),
                content_type: "system",
                tokens: estimate_tokens(&req.system),
                tool_name: None,
            });
        }
        for tool in &req.tools {
            let canonical = tool.canonical_json();
            units.push(Unit {
                hash: sha256_hex(&canonical),
                content_type: "tool",
                tokens: estimate_tokens(&canonical),
                tool_name: Some(tool.name.clone()),
            });
        }
        units
    }

    /// Set `cache_control` on the last text block that doesn't already
    /// carry one. Client-provided cache controls are left alone.
    fn annotate_system_blocks(blocks: &mut [ContentBlock]) {
        if let Some(block) = blocks
            .iter_mut()
            .rev()
            .find(|b| b.block_type == "text" && b.cache_control.is_none())
        {
            let mut control = serde_json::Map::new();
            control.insert("type".to_string(), Value::String("ephemeral".to_string()));
            block.cache_control = Some(control);
        }
    }

    pub async fn process_request(
        &self,
        ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        let ttl = Duration::from_secs(self.config.ttl_secs);
        let mut cache_eligible_tokens = 0i64;
        let mut system_seen = false;

        for unit in Self::units(req) {
            if let Err(e) = self
                .store
                .upsert_fingerprint(&unit.hash, unit.content_type, unit.tokens, &ctx.project)
            {
                tracing::warn!(target: "tokenman::dedup", "fingerprint upsert failed: {e}");
                continue;
            }
            let seen = match self.store.get_fingerprint(&unit.hash) {
                Ok(Some(fp)) => {
                    let age = Utc::now().signed_duration_since(fp.last_seen);
                    fp.hit_count > 1 && age.to_std().unwrap_or_default() <= ttl
                }
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(target: "tokenman::dedup", "fingerprint lookup failed: {e}");
                    false
                }
            };
            if !seen {
                continue;
            }
            cache_eligible_tokens += unit.tokens;
            match unit.tool_name {
                Some(name) => {
                    req.metadata
                        .insert(format!("cache_tool_{}", name), Value::Bool(true));
                }
                None => system_seen = true,
            }
        }

        if system_seen && req.format == ApiFormat::Anthropic {
            if !req.system_blocks.is_empty() {
                Self::annotate_system_blocks(&mut req.system_blocks);
            } else if !req.system.is_empty() {
                let mut block = ContentBlock::text(req.system.clone());
                let mut control = serde_json::Map::new();
                control.insert("type".to_string(), Value::String("ephemeral".to_string()));
                block.cache_control = Some(control);
                req.system_blocks = vec![block];
            }
        }

        // Pure prefix-cache optimization for the OpenAI dialect: move all
        // system messages to the front, keeping relative order in each
        // group. Independent of any dedup hit.
        if req.format == ApiFormat::OpenAI && req.messages.len() > 1 {
            let (system, rest): (Vec<_>, Vec<_>) = req
                .messages
                .drain(..)
                .partition(|m| m.role == "system");
            req.messages = system.into_iter().chain(rest).collect();
        }

        if cache_eligible_tokens > 0 {
            req.metadata.insert(
                "cache_eligible_tokens".to_string(),
                Value::from(cache_eligible_tokens),
            );
            req.set_flag("cache_eligible", true);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::parse;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn anthropic_request(system: &str) -> ProxyRequest {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "system": system,
            "messages": [{"role": "user", "content": "hi"}]
        });
        parse(
            "/v1/messages",
            &serde_json::to_vec(&body).unwrap(),
            HashMap::new(),
        )
        .unwrap()
    }

    fn middleware() -> DedupMiddleware {
        DedupMiddleware::new(DedupConfig::default(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn first_request_is_not_annotated_second_is() {
        let mw = middleware();
        let system = "You are a helpful assistant used for testing dedup.";

        let mut first = anthropic_request(system);
        mw.process_request(&mut RequestContext::new(), &mut first)
            .await
            .unwrap();
        assert!(first.system_blocks.is_empty());

        let mut second = anthropic_request(system);
        mw.process_request(&mut RequestContext::new(), &mut second)
            .await
            .unwrap();
        assert!(!second.system_blocks.is_empty());
        let annotated = second
            .system_blocks
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.cache_control.as_ref())
            .any(|c| c.get("type").and_then(|v| v.as_str()) == Some("ephemeral"));
        assert!(annotated);
        assert!(second.flag("cache_eligible"));
    }

    #[tokio::test]
    async fn client_cache_control_left_untouched() {
        let mw = middleware();
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "system": [
                {"type": "text", "text": "first block"},
                {"type": "text", "text": "second block", "cache_control": {"type": "persistent"}}
            ],
            "messages": []
        });
        let make = || {
            parse(
                "/v1/messages",
                &serde_json::to_vec(&body).unwrap(),
                HashMap::new(),
            )
            .unwrap()
        };
        let mut first = make();
        mw.process_request(&mut RequestContext::new(), &mut first)
            .await
            .unwrap();
        let mut second = make();
        mw.process_request(&mut RequestContext::new(), &mut second)
            .await
            .unwrap();

        // second block keeps the client's own control; the first gets ours
        assert_eq!(
            second.system_blocks[1]
                .cache_control
                .as_ref()
                .and_then(|c| c.get("type"))
                .and_then(|v| v.as_str()),
            Some("persistent")
        );
        assert_eq!(
            second.system_blocks[0]
                .cache_control
                .as_ref()
                .and_then(|c| c.get("type"))
                .and_then(|v| v.as_str()),
            Some("ephemeral")
        );
    }

    #[tokio::test]
    async fn openai_system_messages_move_to_front() {
        let mw = middleware();
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "system", "content": "Be helpful."},
                {"role": "assistant", "content": "Hi there!"},
                {"role": "system", "content": "Be concise."}
            ]
        });
        let mut req = parse(
            "/v1/chat/completions",
            &serde_json::to_vec(&body).unwrap(),
            HashMap::new(),
        )
        .unwrap();
        mw.process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap();
        let roles: Vec<_> = req.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "system", "user", "assistant"]);
        assert_eq!(req.messages[0].content.flat_text(), "Be helpful.");
        assert_eq!(req.messages[1].content.flat_text(), "Be concise.");
    }

    #[tokio::test]
    async fn fingerprints_carry_the_request_project() {
        let store = Arc::new(MemoryStore::new());
        let mw = DedupMiddleware::new(DedupConfig::default(), store.clone());
        let system = "You are a project-tagged assistant.";
        let mut ctx = RequestContext::new();
        ctx.project = "acme".to_string();
        let mut req = anthropic_request(system);
        mw.process_request(&mut ctx, &mut req).await.unwrap();
        assert_eq!(
            store.fingerprint_project(&sha256_hex(system)),
            Some("acme".to_string())
        );
    }

    #[tokio::test]
    async fn repeat_tool_gets_cache_flag() {
        let mw = middleware();
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [],
            "tools": [{"name": "search", "description": "Search things", "input_schema": {}}]
        });
        let make = || {
            parse(
                "/v1/messages",
                &serde_json::to_vec(&body).unwrap(),
                HashMap::new(),
            )
            .unwrap()
        };
        let mut first = make();
        mw.process_request(&mut RequestContext::new(), &mut first)
            .await
            .unwrap();
        assert!(first.metadata.get("cache_tool_search").is_none());

        let mut second = make();
        mw.process_request(&mut RequestContext::new(), &mut second)
            .await
            .unwrap();
        assert_eq!(
            second.metadata.get("cache_tool_search"),
            Some(&Value::Bool(true))
        );
    }
}
