//! Heartbeat middleware
//!
//! Classifies trivial keep-alive requests by message shape, downgrades
//! them to a cheaper model and deduplicates recent identical heartbeats
//! through a small in-memory cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::HeartbeatConfig;
use crate::error::ProxyResult;
use crate::middleware::dedup::sha256_hex;
use crate::proxy::context::RequestContext;
use crate::proxy::request::{ProxyRequest, ProxyResponse};

/// Header that disables the heartbeat optimization for one request.
const PRIORITY_HEADER: &str = "x-tokenman-priority";

struct CacheEntry {
    #[allow(dead_code)]
    body: Vec<u8>,
    expires_at: Instant,
}

pub struct HeartbeatMiddleware {
    config: HeartbeatConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl HeartbeatMiddleware {
    pub fn new(config: HeartbeatConfig) -> Self {
        HeartbeatMiddleware {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        "heartbeat"
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// A request is a heartbeat iff a system prompt exists, at most two
    /// user messages are present, and the last message carries no tool
    /// invocation.
    fn is_heartbeat(req: &ProxyRequest) -> bool {
        let has_system = !req.system.is_empty() || !req.system_blocks.is_empty();
        if !has_system {
            return false;
        }
        if req.user_message_count() > 2 {
            return false;
        }
        match req.messages.last() {
            Some(last) => !last.has_tool_invocation(),
            None => true,
        }
    }

    fn heartbeat_hash(req: &ProxyRequest) -> String {
        let last_user_text = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.flat_text())
            .unwrap_or_default();
        let mut keyed = req.system.clone().into_bytes();
        keyed.push(0);
        keyed.extend_from_slice(last_user_text.as_bytes());
        sha256_hex(&String::from_utf8_lossy(&keyed))
    }

    fn sweep_expired(cache: &mut HashMap<String, CacheEntry>) {
        let now = Instant::now();
        cache.retain(|_, entry| entry.expires_at > now);
    }

    pub async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        if req
            .header(PRIORITY_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("high"))
        {
            return Ok(());
        }
        if !Self::is_heartbeat(req) {
            return Ok(());
        }

        req.set_flag("heartbeat", true);
        req.metadata.insert(
            "request_type".to_string(),
            Value::String("heartbeat".to_string()),
        );

        let hash = Self::heartbeat_hash(req);
        {
            let cache = self.cache.lock().expect("heartbeat cache lock");
            if cache
                .get(&hash)
                .is_some_and(|entry| entry.expires_at > Instant::now())
            {
                req.set_flag("heartbeat_cache_hit", true);
            }
        }
        req.metadata
            .insert("heartbeat_hash".to_string(), Value::String(hash));

        if let Some(model) = self
            .config
            .heartbeat_model
            .as_deref()
            .filter(|m| !m.is_empty())
        {
            req.metadata.insert(
                "original_model".to_string(),
                Value::String(req.model.clone()),
            );
            req.model = model.to_string();
        }
        Ok(())
    }

    pub async fn process_response(
        &self,
        _ctx: &mut RequestContext,
        req: &ProxyRequest,
        resp: &mut ProxyResponse,
    ) -> ProxyResult<()> {
        if !req.flag("heartbeat") {
            return Ok(());
        }
        if let Some(hash) = req.metadata_str("heartbeat_hash") {
            let mut cache = self.cache.lock().expect("heartbeat cache lock");
            cache.insert(
                hash.to_string(),
                CacheEntry {
                    body: resp.body.clone(),
                    expires_at: Instant::now()
                        + Duration::from_secs(self.config.dedup_window_secs),
                },
            );
            Self::sweep_expired(&mut cache);
        }
        resp.request_type = "heartbeat".to_string();
        Ok(())
    }
}
