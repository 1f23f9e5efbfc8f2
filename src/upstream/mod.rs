//! Upstream dispatcher
//!
//! Resolves the provider (with fallback), guards every attempt behind
//! the provider's circuit breaker, retries transient statuses with
//! backoff, and forwards the rewritten body. Streaming responses are
//! pumped through the SSE parser: events go to the client verbatim
//! while text deltas accumulate for accounting.

pub mod breaker;
pub mod forward;
pub mod retry;
pub mod router;
pub mod sse;

use std::time::Instant;

use axum::body::Bytes;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::{ProviderConfig, RetryConfig, Settings};
use crate::error::{ProxyError, ProxyResult};
use crate::pricing::{estimate_tokens, request_cost};
use crate::proxy::context::RequestContext;
use crate::proxy::request::{to_outbound_body, ProxyRequest, ProxyResponse};

use breaker::BreakerRegistry;
use router::Router;
use sse::{DeltaAccumulator, SseParser};

/// A live upstream SSE stream: re-emitted events plus a completion
/// channel that yields the final accumulated response.
pub struct StreamHandle {
    pub status: u16,
    pub events: mpsc::Receiver<Result<Bytes, std::io::Error>>,
    pub completion: oneshot::Receiver<ProxyResponse>,
}

pub struct UpstreamDispatcher {
    router: Router,
    breakers: BreakerRegistry,
    retry: RetryConfig,
    max_response_size: usize,
    max_accumulator_size: usize,
}

/// (input, output, cached) token counts from a response body.
fn extract_usage(body: &Value) -> (i64, i64, i64) {
    let Some(usage) = body.get("usage") else {
        return (0, 0, 0);
    };
    let get = |key: &str| usage.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
    if usage.get("input_tokens").is_some() {
        let cached = get("cache_read_input_tokens");
        (
            get("input_tokens") + get("cache_creation_input_tokens") + cached,
            get("output_tokens"),
            cached,
        )
    } else {
        (get("prompt_tokens"), get("completion_tokens"), 0)
    }
}

/// Token savings the pipeline accumulated in request metadata.
fn tokens_saved(req: &ProxyRequest) -> i64 {
    let meta = |key: &str| {
        req.metadata
            .get(key)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    };
    let history = (meta("history_original_tokens") - meta("history_compressed_tokens")).max(0);
    history + meta("rules_tokens_saved")
}

impl UpstreamDispatcher {
    pub fn from_settings(settings: &Settings) -> Self {
        UpstreamDispatcher {
            router: Router::from_settings(settings),
            breakers: BreakerRegistry::new(settings.breaker.clone()),
            retry: settings.retry.clone(),
            max_response_size: settings.server.max_response_size,
            max_accumulator_size: settings.streaming.max_accumulator_size,
        }
    }

    /// One provider, up to `max_attempts` tries. Returns the successful
    /// response, a passthrough error for non-retryable statuses, or the
    /// terminal transient error.
    async fn attempt_provider(
        &self,
        ctx: &RequestContext,
        req: &ProxyRequest,
        provider: &ProviderConfig,
        body: &[u8],
        streaming: bool,
    ) -> ProxyResult<reqwest::Response> {
        let breaker = self.breakers.for_provider(&provider.name);
        let mut attempt = 0u32;
        loop {
            let builder = forward::build_request(provider, req, body.to_vec(), streaming)?;
            let sent = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(ProxyError::StreamingInterrupted(
                        "request cancelled mid-flight".to_string(),
                    ));
                }
                result = builder.send() => result,
            };

            match sent {
                Err(e) => {
                    breaker.record_failure();
                    tracing::warn!(
                        target: "tokenman::upstream",
                        provider = %provider.name,
                        attempt,
                        "upstream request failed: {e}"
                    );
                    if attempt + 1 >= self.retry.max_attempts {
                        return Err(ProxyError::RequestFailed(e.to_string()));
                    }
                    let delay = retry::backoff_delay(attempt, &self.retry);
                    retry::sleep_cancellable(delay, &ctx.cancel).await?;
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        breaker.record_success();
                        return Ok(response);
                    }
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(retry::parse_retry_after);
                    if retry::is_retryable(status) {
                        breaker.record_failure();
                        if attempt + 1 >= self.retry.max_attempts {
                            return Err(ProxyError::UpstreamUnavailable { status });
                        }
                        let delay = retry_after
                            .unwrap_or_else(|| retry::backoff_delay(attempt, &self.retry));
                        retry::sleep_cancellable(delay, &ctx.cancel).await?;
                    } else {
                        // non-retryable status passes through with body
                        let body = response.bytes().await.unwrap_or_default();
                        return Err(ProxyError::UpstreamStatus {
                            status,
                            retry_after: retry_after.map(|d| d.as_secs()),
                            body: body.to_vec(),
                        });
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Iterate the fallback list until one provider yields a usable
    /// response. Passthrough statuses stop the iteration; the request is
    /// bad for every provider.
    async fn send(
        &self,
        ctx: &RequestContext,
        req: &ProxyRequest,
        body: &[u8],
        streaming: bool,
    ) -> ProxyResult<(ProviderConfig, reqwest::Response)> {
        let providers = self.router.fallback_list(&req.model)?;
        let mut last_err: Option<ProxyError> = None;
        for provider in providers {
            let breaker = self.breakers.for_provider(&provider.name);
            if !breaker.allow() {
                tracing::debug!(
                    target: "tokenman::upstream",
                    provider = %provider.name,
                    "circuit open, skipping provider"
                );
                last_err = Some(ProxyError::CircuitOpen(provider.name.clone()));
                continue;
            }
            match self
                .attempt_provider(ctx, req, &provider, body, streaming)
                .await
            {
                Ok(response) => return Ok((provider, response)),
                Err(err @ ProxyError::UpstreamStatus { .. }) => return Err(err),
                Err(err @ ProxyError::StreamingInterrupted(_)) => return Err(err),
                Err(err) => {
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(ProxyError::NoProviderForModel(req.model.clone())))
    }

    /// Non-streaming dispatch.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        req: &ProxyRequest,
    ) -> ProxyResult<ProxyResponse> {
        let start = Instant::now();
        let body = to_outbound_body(req)?;
        let (provider, response) = self.send(ctx, req, &body, false).await?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::RequestFailed(format!("failed to read response: {e}")))?;
        if self.max_response_size > 0 && bytes.len() > self.max_response_size {
            return Err(ProxyError::ResponseTooLarge(self.max_response_size));
        }

        let parsed: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        let (mut tokens_in, tokens_out, tokens_cached) = extract_usage(&parsed);
        if tokens_in == 0 {
            tokens_in = req.tokens_in;
        }
        let model = parsed
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&req.model)
            .to_string();
        let saved = tokens_saved(req);

        Ok(ProxyResponse {
            request_id: req.id.clone(),
            status_code: status,
            cost_usd: request_cost(&model, tokens_in, tokens_out),
            savings_usd: request_cost(&model, saved, 0),
            model,
            tokens_out,
            tokens_cached,
            tokens_saved: saved,
            streaming: false,
            body: bytes.to_vec(),
            latency: start.elapsed(),
            cache_hit: false,
            request_type: req
                .metadata_str("request_type")
                .unwrap_or("chat")
                .to_string(),
            provider: provider.name,
            error: None,
            flags: Default::default(),
        })
    }

    /// Streaming dispatch. Events are forwarded through the returned
    /// channel; the completion channel yields the accumulated response
    /// once the stream ends (or is cancelled, with whatever was
    /// accumulated so far).
    pub async fn dispatch_stream(
        &self,
        ctx: &RequestContext,
        req: &ProxyRequest,
    ) -> ProxyResult<StreamHandle> {
        let start = Instant::now();
        let body = to_outbound_body(req)?;
        let (provider, response) = self.send(ctx, req, &body, true).await?;
        let status = response.status().as_u16();

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
        let (done_tx, done_rx) = oneshot::channel();

        let cancel = ctx.cancel.clone();
        let format = provider.format;
        let cap = self.max_accumulator_size;
        let request_id = req.id.clone();
        let fallback_model = req.model.clone();
        let request_type = req
            .metadata_str("request_type")
            .unwrap_or("chat")
            .to_string();
        let provider_name = provider.name.clone();
        let tokens_in = req.tokens_in;
        let saved = tokens_saved(req);

        tokio::spawn(async move {
            let pump = std::panic::AssertUnwindSafe(async move {
                let mut parser = SseParser::new();
                let mut acc = DeltaAccumulator::new(format, cap);
                let mut stream = response.bytes_stream();
                let mut error: Option<String> = None;

                'pump: loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => {
                            error = Some("request cancelled".to_string());
                            break 'pump;
                        }
                        chunk = stream.next() => chunk,
                    };
                    match chunk {
                        None => break 'pump,
                        Some(Err(e)) => {
                            let _ = tx
                                .send(Err(std::io::Error::new(
                                    std::io::ErrorKind::Other,
                                    e.to_string(),
                                )))
                                .await;
                            error = Some(e.to_string());
                            break 'pump;
                        }
                        Some(Ok(bytes)) => {
                            for event in parser.push(&bytes) {
                                if !event.is_done() {
                                    acc.ingest(&event.data);
                                }
                                if tx.send(Ok(Bytes::from(event.raw))).await.is_err() {
                                    error = Some("client disconnected".to_string());
                                    break 'pump;
                                }
                            }
                        }
                    }
                }
                (acc, error)
            })
            .catch_unwind()
            .await;

            let (acc, error) = match pump {
                Ok(result) => result,
                Err(_) => (
                    DeltaAccumulator::new(format, cap),
                    Some("panic in stream pump".to_string()),
                ),
            };

            let model = if acc.model.is_empty() {
                fallback_model
            } else {
                acc.model.clone()
            };
            let tokens_out = if acc.output_tokens > 0 {
                acc.output_tokens
            } else {
                estimate_tokens(acc.text())
            };
            let final_response = ProxyResponse {
                request_id,
                status_code: status,
                cost_usd: request_cost(&model, tokens_in, tokens_out),
                savings_usd: request_cost(&model, saved, 0),
                model,
                tokens_out,
                tokens_cached: 0,
                tokens_saved: saved,
                streaming: true,
                body: acc.into_text().into_bytes(),
                latency: start.elapsed(),
                cache_hit: false,
                request_type,
                provider: provider_name,
                error,
                flags: Default::default(),
            };
            let _ = done_tx.send(final_response);
        });

        Ok(StreamHandle {
            status,
            events: rx,
            completion: done_rx,
        })
    }
}
