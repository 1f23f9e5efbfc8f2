//! Middleware chain
//!
//! Runs middlewares forward over the request and in reverse over the
//! response, recording per-middleware wall time, honoring the cache-hit
//! short-circuit after every step and converting panics into errors.

use std::time::Instant;

use futures_util::FutureExt;

use crate::config::Settings;
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{
    BudgetMiddleware, DedupMiddleware, HeartbeatMiddleware, HistoryMiddleware,
    InjectionMiddleware, PiiMiddleware, RateLimitMiddleware, RulesMiddleware,
};
use crate::proxy::context::RequestContext;
use crate::proxy::request::{CachedResponse, ProxyRequest, ProxyResponse};
use crate::store::{BudgetStore, FingerprintStore, PiiLogger};

/// Dispatch enum over the concrete middlewares.
pub enum PipelineMiddleware {
    Dedup(DedupMiddleware),
    Heartbeat(HeartbeatMiddleware),
    History(HistoryMiddleware),
    Rules(RulesMiddleware),
    Pii(PiiMiddleware),
    Injection(InjectionMiddleware),
    RateLimit(RateLimitMiddleware),
    Budget(BudgetMiddleware),
}

impl PipelineMiddleware {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineMiddleware::Dedup(m) => m.name(),
            PipelineMiddleware::Heartbeat(m) => m.name(),
            PipelineMiddleware::History(m) => m.name(),
            PipelineMiddleware::Rules(m) => m.name(),
            PipelineMiddleware::Pii(m) => m.name(),
            PipelineMiddleware::Injection(m) => m.name(),
            PipelineMiddleware::RateLimit(m) => m.name(),
            PipelineMiddleware::Budget(m) => m.name(),
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            PipelineMiddleware::Dedup(m) => m.enabled(),
            PipelineMiddleware::Heartbeat(m) => m.enabled(),
            PipelineMiddleware::History(m) => m.enabled(),
            PipelineMiddleware::Rules(m) => m.enabled(),
            PipelineMiddleware::Pii(m) => m.enabled(),
            PipelineMiddleware::Injection(m) => m.enabled(),
            PipelineMiddleware::RateLimit(m) => m.enabled(),
            PipelineMiddleware::Budget(m) => m.enabled(),
        }
    }

    async fn process_request(
        &self,
        ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<()> {
        match self {
            PipelineMiddleware::Dedup(m) => m.process_request(ctx, req).await,
            PipelineMiddleware::Heartbeat(m) => m.process_request(ctx, req).await,
            PipelineMiddleware::History(m) => m.process_request(ctx, req).await,
            PipelineMiddleware::Rules(m) => m.process_request(ctx, req).await,
            PipelineMiddleware::Pii(m) => m.process_request(ctx, req).await,
            PipelineMiddleware::Injection(m) => m.process_request(ctx, req).await,
            PipelineMiddleware::RateLimit(m) => m.process_request(ctx, req).await,
            PipelineMiddleware::Budget(m) => m.process_request(ctx, req).await,
        }
    }

    async fn process_response(
        &self,
        ctx: &mut RequestContext,
        req: &ProxyRequest,
        resp: &mut ProxyResponse,
    ) -> ProxyResult<()> {
        match self {
            PipelineMiddleware::Dedup(m) => m.process_response(ctx, req, resp).await,
            PipelineMiddleware::Heartbeat(m) => m.process_response(ctx, req, resp).await,
            PipelineMiddleware::History(m) => m.process_response(ctx, req, resp).await,
            PipelineMiddleware::Rules(m) => m.process_response(ctx, req, resp).await,
            PipelineMiddleware::Pii(m) => m.process_response(ctx, req, resp).await,
            PipelineMiddleware::Injection(m) => m.process_response(ctx, req, resp).await,
            PipelineMiddleware::RateLimit(m) => m.process_response(ctx, req, resp).await,
            PipelineMiddleware::Budget(m) => m.process_response(ctx, req, resp).await,
        }
    }
}

/// Stringify a recovered panic payload.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct Chain {
    middlewares: Vec<PipelineMiddleware>,
}

impl Chain {
    pub fn new(middlewares: Vec<PipelineMiddleware>) -> Self {
        Chain { middlewares }
    }

    /// Assemble the standard middleware order from a settings snapshot.
    pub fn from_settings(
        settings: &Settings,
        fingerprints: std::sync::Arc<dyn FingerprintStore>,
        budgets: std::sync::Arc<dyn BudgetStore>,
        pii_logger: Option<std::sync::Arc<dyn PiiLogger>>,
    ) -> Self {
        Chain::new(vec![
            PipelineMiddleware::Dedup(DedupMiddleware::new(settings.dedup.clone(), fingerprints)),
            PipelineMiddleware::Heartbeat(HeartbeatMiddleware::new(settings.heartbeat.clone())),
            PipelineMiddleware::History(HistoryMiddleware::new(settings.history.clone())),
            PipelineMiddleware::Rules(RulesMiddleware::new(settings.rules.clone())),
            PipelineMiddleware::Pii(PiiMiddleware::new(settings.pii.clone(), pii_logger)),
            PipelineMiddleware::Injection(InjectionMiddleware::new(settings.injection.clone())),
            PipelineMiddleware::RateLimit(RateLimitMiddleware::new(settings.ratelimit.clone())),
            PipelineMiddleware::Budget(BudgetMiddleware::new(settings.budget.clone(), budgets)),
        ])
    }

    /// Extract the cached response after a middleware set the cache_hit
    /// flag: request metadata first, then the context.
    fn take_cached_response(
        ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<CachedResponse> {
        if let Some(value) = req.metadata.remove("cached_response") {
            if let Ok(cached) = serde_json::from_value::<CachedResponse>(value) {
                return Ok(cached);
            }
        }
        if let Some(cached) = ctx.cached_response.take() {
            return Ok(cached);
        }
        Err(ProxyError::CacheHitMissingBody)
    }

    /// Forward phase. Returns a cached response when a middleware
    /// short-circuited; later middlewares do not run in that case.
    pub async fn process_request(
        &self,
        ctx: &mut RequestContext,
        req: &mut ProxyRequest,
    ) -> ProxyResult<Option<CachedResponse>> {
        for (idx, middleware) in self.middlewares.iter().enumerate() {
            if !middleware.enabled() {
                continue;
            }
            let name = middleware.name();
            let start = Instant::now();
            let outcome = std::panic::AssertUnwindSafe(middleware.process_request(ctx, req))
                .catch_unwind()
                .await;
            ctx.record_timing(name.to_string(), start.elapsed());
            ctx.ran.push(idx);

            match outcome {
                Err(payload) => {
                    return Err(ProxyError::PipelineInternal(format!(
                        "panic in middleware '{}': {}",
                        name,
                        panic_message(payload)
                    )));
                }
                Ok(Err(err)) => return Err(err.in_middleware(name)),
                Ok(Ok(())) => {}
            }

            if req.flag("cache_hit") {
                let cached = Self::take_cached_response(ctx, req)?;
                tracing::debug!(
                    target: "tokenman::pipeline",
                    middleware = name,
                    "cache hit short-circuit"
                );
                return Ok(Some(cached));
            }
        }
        Ok(None)
    }

    /// Reverse phase over exactly the middlewares that ran forward.
    pub async fn process_response(
        &self,
        ctx: &mut RequestContext,
        req: &ProxyRequest,
        resp: &mut ProxyResponse,
    ) -> ProxyResult<()> {
        let ran = ctx.ran.clone();
        for idx in ran.into_iter().rev() {
            let middleware = &self.middlewares[idx];
            let name = middleware.name();
            let start = Instant::now();
            let outcome = std::panic::AssertUnwindSafe(middleware.process_response(ctx, req, resp))
                .catch_unwind()
                .await;
            ctx.record_timing(format!("{}.response", name), start.elapsed());

            match outcome {
                Err(payload) => {
                    return Err(ProxyError::PipelineInternal(format!(
                        "panic in middleware '{}': {}",
                        name,
                        panic_message(payload)
                    )));
                }
                Ok(Err(err)) => return Err(err.in_middleware(name)),
                Ok(Ok(())) => {}
            }
        }
        Ok(())
    }
}
