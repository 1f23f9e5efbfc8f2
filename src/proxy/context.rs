//! Per-request context threaded through the pipeline
//!
//! Carries cancellation, the middleware timing map and an optional
//! pre-built cached response. Created once by the chain's caller; the
//! request and response objects hold everything else.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::request::CachedResponse;

#[derive(Debug, Default)]
pub struct RequestContext {
    /// Cancelled when the inbound connection closes or a deadline elapses.
    pub cancel: CancellationToken,
    /// Wall time per middleware; response phase entries use `name.response`.
    pub timings: HashMap<String, Duration>,
    /// Short-circuit payload reachable when metadata doesn't carry one.
    pub cached_response: Option<CachedResponse>,
    /// Indices of the middlewares that ran in the request phase, in order.
    pub ran: Vec<usize>,
    /// Project tag from `X-Tokenman-Project`.
    pub project: String,
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext {
            project: "default".to_string(),
            ..Default::default()
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        RequestContext {
            cancel,
            ..Self::new()
        }
    }

    pub fn record_timing(&mut self, key: String, elapsed: Duration) {
        self.timings.insert(key, elapsed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
