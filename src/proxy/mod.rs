//! Proxy engine
//!
//! Orchestration for one inbound call: parse the dialect, run the
//! middleware chain forward, dispatch upstream (or short-circuit on a
//! cache hit), run the chain in reverse, and record metrics. The HTTP
//! layer in `server` stays thin around this.

pub mod chain;
pub mod context;
pub mod request;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::ProxyResult;
use crate::metrics;
use crate::store::{BudgetStore, FingerprintStore, PiiLogger};
use crate::upstream::UpstreamDispatcher;

pub use chain::{Chain, PipelineMiddleware};
pub use context::RequestContext;
pub use request::{CachedResponse, ProxyRequest, ProxyResponse};

/// Result of one proxied call as seen by the HTTP layer.
#[derive(Debug)]
pub enum ProxyOutcome {
    /// Full response in hand (upstream or cached).
    Complete {
        response: ProxyResponse,
        cache_hit: bool,
        content_type: String,
    },
    /// Live SSE stream; events are re-emitted as they arrive.
    Stream {
        status: u16,
        events: mpsc::Receiver<Result<Bytes, std::io::Error>>,
    },
}

pub struct ProxyEngine {
    chain: Arc<Chain>,
    dispatcher: UpstreamDispatcher,
}

fn record_metrics(resp: &ProxyResponse, tokens_in: i64) {
    let m = metrics::global();
    m.requests_total.add(&resp.provider, 1);
    if resp.error.is_some() {
        m.requests_failed.add(&resp.provider, 1);
    }
    m.tokens_in.add(tokens_in.max(0) as u64);
    m.tokens_out.add(resp.tokens_out.max(0) as u64);
    m.tokens_saved.add(resp.tokens_saved.max(0) as u64);
    m.cost_usd.add(resp.cost_usd);
    m.savings_usd.add(resp.savings_usd);
    m.request_latency.observe_ms(resp.latency.as_millis() as u64);
}

impl ProxyEngine {
    pub fn new(
        settings: &Settings,
        fingerprints: Arc<dyn FingerprintStore>,
        budgets: Arc<dyn BudgetStore>,
        pii_logger: Option<Arc<dyn PiiLogger>>,
    ) -> Self {
        ProxyEngine {
            chain: Arc::new(Chain::from_settings(
                settings,
                fingerprints,
                budgets,
                pii_logger,
            )),
            dispatcher: UpstreamDispatcher::from_settings(settings),
        }
    }

    /// Run one request end to end.
    pub async fn handle(
        self: &Arc<Self>,
        path: &str,
        headers: HashMap<String, String>,
        body: &[u8],
        cancel: CancellationToken,
    ) -> ProxyResult<ProxyOutcome> {
        let mut req = request::parse(path, body, headers)?;
        let mut ctx = RequestContext::with_cancel(cancel);
        if let Some(project) = req.header("x-tokenman-project") {
            ctx.project = project.to_string();
        }
        let tokens_in = req.tokens_in;

        if let Some(cached) = self.chain.process_request(&mut ctx, &mut req).await? {
            metrics::global().cache_hits.inc();
            let response = ProxyResponse {
                request_id: req.id.clone(),
                status_code: cached.status_code,
                model: req.model.clone(),
                streaming: false,
                body: cached.body,
                cache_hit: true,
                request_type: req
                    .metadata_str("request_type")
                    .unwrap_or("chat")
                    .to_string(),
                ..Default::default()
            };
            record_metrics(&response, tokens_in);
            // a cache short-circuit bypasses the response phase entirely
            return Ok(ProxyOutcome::Complete {
                response,
                cache_hit: true,
                content_type: cached.content_type,
            });
        }
        metrics::global().cache_misses.inc();

        if req.stream {
            let handle = self.dispatcher.dispatch_stream(&ctx, &req).await?;
            let status = handle.status;
            let events = handle.events;
            let completion = handle.completion;
            let chain = self.chain.clone();
            // the reverse phase and accounting run once the stream ends,
            // cancelled or not
            tokio::spawn(async move {
                let Ok(mut resp) = completion.await else {
                    return;
                };
                if let Err(e) = chain.process_response(&mut ctx, &req, &mut resp).await {
                    tracing::warn!(
                        target: "tokenman::proxy",
                        request = %req.id,
                        "response phase failed after stream: {e}"
                    );
                    resp.error = Some(e.to_string());
                }
                record_metrics(&resp, tokens_in);
            });
            return Ok(ProxyOutcome::Stream { status, events });
        }

        let mut resp = self.dispatcher.dispatch(&ctx, &req).await?;
        if let Err(e) = self.chain.process_response(&mut ctx, &req, &mut resp).await {
            // the upstream body still goes out; the error is recorded for
            // accounting only
            tracing::warn!(
                target: "tokenman::proxy",
                request = %req.id,
                "response phase failed: {e}"
            );
            resp.error = Some(e.to_string());
        }
        record_metrics(&resp, tokens_in);
        Ok(ProxyOutcome::Complete {
            response: resp,
            cache_hit: false,
            content_type: "application/json".to_string(),
        })
    }
}
