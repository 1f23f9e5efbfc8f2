//! Proxy error types
//!
//! Defines all error types surfaced by the pipeline, the upstream
//! dispatcher and the HTTP layer, together with their client-facing
//! JSON mapping.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error type for the whole proxy path
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request body could not be parsed into the recognized dialect
    #[error("malformed body: {0}")]
    MalformedBody(String),
    /// URL path is not one of the recognized endpoint shapes
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),
    /// PII middleware is in block mode and found matches
    #[error("PII detected: {}", types.join(", "))]
    PiiDetected { types: Vec<String> },
    /// Injection middleware is in block mode and found matches
    #[error("prompt injection detected: {}", categories.join(", "))]
    InjectionDetected { categories: Vec<String> },
    /// Token bucket for the provider is exhausted
    #[error("rate limit exceeded for provider '{provider}'")]
    RateLimitExceeded {
        provider: String,
        rate: f64,
        retry_after: f64,
    },
    /// A configured spend cap has been reached
    #[error("{period} budget exceeded: spent ${spent:.6} / limit ${limit:.6}")]
    BudgetExceeded {
        period: String,
        limit: f64,
        spent: f64,
    },
    /// Router found no enabled provider for the requested model
    #[error("no provider configured for model '{0}'")]
    NoProviderForModel(String),
    /// Circuit breaker refused the call before any upstream attempt
    #[error("circuit open for provider '{0}'")]
    CircuitOpen(String),
    /// All retry attempts exhausted on a transient upstream status
    #[error("upstream unavailable, last status {status}")]
    UpstreamUnavailable { status: u16 },
    /// Non-retryable upstream status, passed through to the client
    #[error("upstream returned status {status}")]
    UpstreamStatus {
        status: u16,
        retry_after: Option<u64>,
        body: Vec<u8>,
    },
    /// Request to the upstream could not be completed at all
    #[error("upstream request failed: {0}")]
    RequestFailed(String),
    /// cache_hit flag was set but no cached response was reachable
    #[error("cache hit flagged but no cached response body present")]
    CacheHitMissingBody,
    /// A middleware returned an error; the inner mapping is preserved
    #[error("middleware '{name}': {source}")]
    Middleware {
        name: &'static str,
        #[source]
        source: Box<ProxyError>,
    },
    /// Missing bearer token while proxy auth is enabled
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Bearer token present but not matching
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Inbound body exceeded max_body_size
    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    /// Upstream body exceeded max_response_size
    #[error("upstream response exceeds {0} bytes")]
    ResponseTooLarge(usize),
    /// Stream terminated early; partial content may have been written
    #[error("streaming interrupted: {0}")]
    StreamingInterrupted(String),
    /// Recovered panic or other unexpected pipeline failure
    #[error("pipeline internal error: {0}")]
    PipelineInternal(String),
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Wrap an error with the middleware it came from, preserving the
    /// inner error's HTTP mapping.
    pub fn in_middleware(self, name: &'static str) -> ProxyError {
        ProxyError::Middleware {
            name,
            source: Box::new(self),
        }
    }

    /// Innermost error, unwrapping middleware layers.
    pub fn root(&self) -> &ProxyError {
        match self {
            ProxyError::Middleware { source, .. } => source.root(),
            other => other,
        }
    }

    /// Machine-readable kind used in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            ProxyError::PiiDetected { .. } => "pii_detected",
            ProxyError::InjectionDetected { .. } => "injection_detected",
            ProxyError::BudgetExceeded { .. } => "budget_exceeded",
            ProxyError::RateLimitExceeded { .. } => "rate_limit_error",
            _ => "proxy_error",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.root() {
            ProxyError::MalformedBody(_)
            | ProxyError::UnsupportedEndpoint(_)
            | ProxyError::PiiDetected { .. }
            | ProxyError::InjectionDetected { .. } => StatusCode::BAD_REQUEST,
            ProxyError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::RateLimitExceeded { .. } | ProxyError::BudgetExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::NoProviderForModel(_)
            | ProxyError::CircuitOpen(_)
            | ProxyError::UpstreamUnavailable { .. }
            | ProxyError::RequestFailed(_)
            | ProxyError::ResponseTooLarge(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::CacheHitMissingBody
            | ProxyError::StreamingInterrupted(_)
            | ProxyError::PipelineInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // root() never returns a Middleware wrapper
            ProxyError::Middleware { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Retry-After header value in seconds, when applicable.
    fn retry_after_secs(&self) -> Option<u64> {
        match self.root() {
            ProxyError::RateLimitExceeded { retry_after, .. } => {
                Some(retry_after.ceil().max(1.0) as u64)
            }
            ProxyError::BudgetExceeded { .. } => Some(60),
            ProxyError::UpstreamStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        // Non-retryable upstream statuses pass the upstream body through
        // untouched so clients see the provider's own error shape.
        if let ProxyError::UpstreamStatus {
            status,
            retry_after,
            body,
        } = &self
        {
            let mut response = (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                body.clone(),
            )
                .into_response();
            if let Some(secs) = retry_after {
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            return response;
        }

        let status = self.status_code();
        let kind = self.kind();
        let message = self.to_string();

        tracing::error!(
            target: "tokenman::error",
            status = status.as_u16(),
            kind,
            %message,
            "returning error response"
        );

        let mut error = json!({
            "type": kind,
            "message": message,
        });
        match self.root() {
            ProxyError::BudgetExceeded {
                period,
                limit,
                spent,
            } => {
                error["period"] = json!(period);
                error["limit"] = json!(limit);
                error["spent"] = json!(spent);
            }
            ProxyError::RateLimitExceeded {
                provider,
                retry_after,
                ..
            } => {
                error["provider"] = json!(provider);
                error["retry_after"] = json!(retry_after);
            }
            ProxyError::PiiDetected { types } => {
                error["detected_types"] = json!(types);
            }
            ProxyError::InjectionDetected { categories } => {
                error["categories"] = json!(categories);
            }
            _ => {}
        }

        let retry_after = self.retry_after_secs();
        let mut response = (status, Json(json!({ "error": error }))).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_of_wrapped_error_is_preserved() {
        let err = ProxyError::PiiDetected {
            types: vec!["EMAIL".to_string()],
        }
        .in_middleware("pii");
        assert_eq!(err.kind(), "pii_detected");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("pii"));
    }

    #[test]
    fn budget_maps_to_429_with_retry_after() {
        let err = ProxyError::BudgetExceeded {
            period: "daily".to_string(),
            limit: 10.0,
            spent: 10.5,
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_secs(), Some(60));
        assert_eq!(err.kind(), "budget_exceeded");
    }

    #[test]
    fn unknown_kinds_fall_back_to_proxy_error() {
        let err = ProxyError::NoProviderForModel("gpt-9".to_string());
        assert_eq!(err.kind(), "proxy_error");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
