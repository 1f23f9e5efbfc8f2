//! Rate-limit middleware
//!
//! One token bucket per provider, created lazily with the default rate
//! and burst unless an explicit override exists. Buckets refill
//! continuously at `rate` tokens per second up to `burst`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::context::RequestContext;
use crate::proxy::request::{ProxyRequest, ProxyResponse};

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: u32,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        TokenBucket {
            rate,
            burst,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Refill by elapsed time, then take one token if available.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst as f64);
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

struct Buckets {
    config: RateLimitConfig,
    by_provider: HashMap<String, TokenBucket>,
}

pub struct RateLimitMiddleware {
    inner: Mutex<Buckets>,
    enabled: bool,
}

/// Infer the provider from the model name when the router hasn't run yet.
fn infer_provider(model: &str) -> &'static str {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude") {
        "anthropic"
    } else if m.starts_with("gpt") || m.starts_with("o1") || m.starts_with("o3") {
        "openai"
    } else {
        "default"
    }
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Self {
        let enabled = config.enabled;
        RateLimitMiddleware {
            inner: Mutex::new(Buckets {
                config,
                by_provider: HashMap::new(),
            }),
            enabled,
        }
    }

    pub fn name(&self) -> &'static str {
        "ratelimit"
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Replace the bucket configuration atomically. Existing buckets are
    /// dropped so new rates apply immediately.
    pub fn reconfigure(&self, config: RateLimitConfig) {
        let mut inner = self.inner.lock().expect("rate limit lock");
        inner.config = config;
        inner.by_provider.clear();
    }

    fn check(&self, provider: &str) -> ProxyResult<()> {
        let mut inner = self.inner.lock().expect("rate limit lock");
        let (rate, burst) = match inner.config.providers.get(provider) {
            Some(bucket) => (bucket.rate, bucket.burst),
            None => (inner.config.default_rate, inner.config.default_burst),
        };
        let bucket = inner
            .by_provider
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(rate, burst));
        if bucket.allow() {
            return Ok(());
        }
        let rate = bucket.rate();
        Err(ProxyError::RateLimitExceeded {
            provider: provider.to_string(),
            rate,
            retry_after: (1.0 / rate).max(0.1),
        })
    }

    pub async fn process_request(
        &self,
        _ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        let provider = match req.metadata_str("provider").filter(|p| !p.is_empty()) {
            Some(provider) => provider.to_string(),
            None => {
                if req.model.is_empty() {
                    return Ok(());
                }
                infer_provider(&req.model).to_string()
            }
        };
        self.check(&provider)
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
    use serde_json::Value;
    use std::collections::HashMap as StdHashMap;

    fn request(model: &str) -> ProxyRequest {
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}]
        });
        parse(
            "/v1/chat/completions",
            &serde_json::to_vec(&body).unwrap(),
            StdHashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn bucket_burst_then_rejects() {
        let mut bucket = TokenBucket::new(0.0001, 3);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1000.0, 1);
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.allow());
    }

    #[tokio::test]
    async fn exhausted_bucket_returns_structured_error() {
        let mut providers = StdHashMap::new();
        providers.insert(
            "anthropic".to_string(),
            crate::config::BucketConfig {
                rate: 0.5,
                burst: 1,
            },
        );
        let mw = RateLimitMiddleware::new(RateLimitConfig {
            enabled: true,
            default_rate: 100.0,
            default_burst: 100,
            providers,
        });

        let mut req = request("claude-sonnet-4-20250514");
        mw.process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap();
        let err = mw
            .process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap_err();
        match err {
            ProxyError::RateLimitExceeded {
                provider,
                rate,
                retry_after,
            } => {
                assert_eq!(provider, "anthropic");
                assert!((rate - 0.5).abs() < 1e-9);
                assert!((retry_after - 2.0).abs() < 1e-9);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_provider_metadata_wins() {
        let mut providers = StdHashMap::new();
        providers.insert(
            "special".to_string(),
            crate::config::BucketConfig {
                rate: 0.001,
                burst: 1,
            },
        );
        let mw = RateLimitMiddleware::new(RateLimitConfig {
            enabled: true,
            default_rate: 100.0,
            default_burst: 100,
            providers,
        });
        let mut req = request("gpt-4o");
        req.metadata
            .insert("provider".to_string(), Value::String("special".to_string()));
        mw.process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap();
        assert!(mw
            .process_request(&mut RequestContext::new(), &mut req)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn empty_model_skips_check() {
        let mw = RateLimitMiddleware::new(RateLimitConfig {
            enabled: true,
            default_rate: 0.001,
            default_burst: 0,
            providers: StdHashMap::new(),
        });
        let body = serde_json::json!({"messages": []});
        let mut req = parse(
            "/v1/chat/completions",
            &serde_json::to_vec(&body).unwrap(),
            StdHashMap::new(),
        )
        .unwrap();
        assert!(mw
            .process_request(&mut RequestContext::new(), &mut req)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn reconfigure_resets_buckets() {
        let mw = RateLimitMiddleware::new(RateLimitConfig {
            enabled: true,
            default_rate: 0.001,
            default_burst: 1,
            providers: StdHashMap::new(),
        });
        let mut req = request("gpt-4o");
        mw.process_request(&mut RequestContext::new(), &mut req)
            .await
            .unwrap();
        assert!(mw
            .process_request(&mut RequestContext::new(), &mut req)
            .await
            .is_err());

        mw.reconfigure(RateLimitConfig {
            enabled: true,
            default_rate: 100.0,
            default_burst: 10,
            providers: StdHashMap::new(),
        });
        assert!(mw
            .process_request(&mut RequestContext::new(), &mut req)
            .await
            .is_ok());
    }
}
