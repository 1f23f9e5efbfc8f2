//! Retry policy
//!
//! Exponential backoff with full jitter over the transient upstream
//! statuses, honoring `Retry-After` when the upstream provides one.
//! Sleeps abort promptly on request cancellation.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{ProxyError, ProxyResult};

/// Transient statuses worth another attempt. Client errors other than
/// 429 are never retried.
pub fn is_retryable(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// `min(max, base * 2^attempt)`, then a uniform draw from `[0, d)`.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exp = config
        .base_ms
        .saturating_mul(1u64 << attempt.min(16));
    let cap = exp.min(config.max_ms).max(1);
    let jittered = rand::thread_rng().gen_range(0..cap);
    Duration::from_millis(jittered)
}

/// Parse a `Retry-After` header value: integer seconds, or an HTTP-date
/// that lies in the future.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok()
}

/// Sleep that aborts as soon as the request is cancelled.
pub async fn sleep_cancellable(
    delay: Duration,
    cancel: &CancellationToken,
) -> ProxyResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::StreamingInterrupted(
            "request cancelled during retry backoff".to_string(),
        )),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
