//! Upstream request building
//!
//! Builds the provider-specific HTTP request: endpoint path and auth
//! headers per dialect, client headers re-emitted, shared connection
//! pool. Non-streaming attempts carry a per-request timeout; streaming
//! requests have none.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::config::{ApiFormat, ProviderConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::request::ProxyRequest;

/// Default Anthropic API version when the client didn't supply one.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Per-attempt timeout for non-streaming requests when the provider
/// doesn't configure one.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Headers never re-emitted to the upstream; auth and version headers
/// are reconstructed explicitly.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "content-type",
    "connection",
    "accept-encoding",
    "transfer-encoding",
    "authorization",
    "x-api-key",
    "anthropic-version",
];

/// Shared pooled client: keep-alive with 10 idle connections per host
/// and a 90 second idle timeout. No default timeout; per-request
/// timeouts are set by the caller.
static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build HTTP client")
});

pub fn client() -> &'static Client {
    &SHARED_CLIENT
}

/// Endpoint path for a provider dialect.
pub fn endpoint_path(format: ApiFormat) -> &'static str {
    match format {
        ApiFormat::Anthropic => "/v1/messages",
        ApiFormat::OpenAI => "/v1/chat/completions",
    }
}

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.contains(&name) || name.starts_with("x-tokenman-")
}

/// Assemble the outbound header set for one provider.
pub fn build_headers(provider: &ProviderConfig, req: &ProxyRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));

    match provider.format {
        ApiFormat::Anthropic => {
            if !provider.api_key.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&provider.api_key) {
                    headers.insert("x-api-key", value);
                }
            } else if let Some(key) = req.header("x-api-key") {
                // passthrough: the client's own credential
                if let Ok(value) = HeaderValue::from_str(key) {
                    headers.insert("x-api-key", value);
                }
            }
            let version = req.header("anthropic-version").unwrap_or(ANTHROPIC_VERSION);
            if let Ok(value) = HeaderValue::from_str(version) {
                headers.insert("anthropic-version", value);
            }
        }
        ApiFormat::OpenAI => {
            let token = if !provider.api_key.is_empty() {
                Some(provider.api_key.clone())
            } else {
                req.header("authorization")
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(|v| v.to_string())
            };
            if let Some(token) = token {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                    headers.insert("authorization", value);
                }
            }
        }
    }

    // every other client header rides through untouched
    for (name, value) in &req.headers {
        if is_reserved(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    headers
}

/// Build the POST for one attempt. `streaming` controls whether a
/// per-attempt timeout applies.
pub fn build_request(
    provider: &ProviderConfig,
    req: &ProxyRequest,
    body: Vec<u8>,
    streaming: bool,
) -> ProxyResult<reqwest::RequestBuilder> {
    if provider.base_url.is_empty() {
        return Err(ProxyError::RequestFailed(format!(
            "provider '{}' has no base_url",
            provider.name
        )));
    }
    let url = format!(
        "{}{}",
        provider.base_url.trim_end_matches('/'),
        endpoint_path(provider.format)
    );
    let mut builder = client()
        .post(&url)
        .headers(build_headers(provider, req))
        .body(body);
    if !streaming {
        let timeout = if provider.timeout_secs > 0 {
            provider.timeout_secs
        } else {
            DEFAULT_TIMEOUT_SECS
        };
        builder = builder.timeout(Duration::from_secs(timeout));
    }
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::parse;
    use std::collections::HashMap;

    fn provider(format: ApiFormat, key: &str) -> ProviderConfig {
        ProviderConfig {
            name: "p".to_string(),
            base_url: "https://api.example.com".to_string(),
            api_key: key.to_string(),
            format,
            models: Vec::new(),
            enabled: true,
            priority: 0,
            timeout_secs: 60,
        }
    }

    fn request_with_headers(headers: HashMap<String, String>) -> ProxyRequest {
        let body = serde_json::json!({"model": "m", "messages": []});
        parse("/v1/messages", &serde_json::to_vec(&body).unwrap(), headers).unwrap()
    }

    #[test]
    fn anthropic_headers_use_api_key_and_version() {
        let headers = build_headers(
            &provider(ApiFormat::Anthropic, "secret-key"),
            &request_with_headers(HashMap::new()),
        );
        assert_eq!(headers.get("x-api-key").unwrap(), "secret-key");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn client_anthropic_version_is_forwarded() {
        let mut client_headers = HashMap::new();
        client_headers.insert("anthropic-version".to_string(), "2024-10-22".to_string());
        let headers = build_headers(
            &provider(ApiFormat::Anthropic, "k"),
            &request_with_headers(client_headers),
        );
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-10-22");
    }

    #[test]
    fn openai_headers_use_bearer() {
        let headers = build_headers(
            &provider(ApiFormat::OpenAI, "sk-test"),
            &request_with_headers(HashMap::new()),
        );
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test");
    }

    #[test]
    fn extra_client_headers_ride_through() {
        let mut client_headers = HashMap::new();
        client_headers.insert("traceparent".to_string(), "00-abc-def-01".to_string());
        client_headers.insert("x-tokenman-project".to_string(), "demo".to_string());
        client_headers.insert("authorization".to_string(), "Bearer client".to_string());
        let headers = build_headers(
            &provider(ApiFormat::Anthropic, "k"),
            &request_with_headers(client_headers),
        );
        assert_eq!(headers.get("traceparent").unwrap(), "00-abc-def-01");
        // internal and auth headers never leak through the generic path
        assert!(headers.get("x-tokenman-project").is_none());
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn passthrough_credentials_when_provider_has_no_key() {
        let mut client_headers = HashMap::new();
        client_headers.insert("authorization".to_string(), "Bearer client-key".to_string());
        let headers = build_headers(
            &provider(ApiFormat::OpenAI, ""),
            &request_with_headers(client_headers),
        );
        assert_eq!(headers.get("authorization").unwrap(), "Bearer client-key");
    }

    #[test]
    fn paths_follow_dialect() {
        assert_eq!(endpoint_path(ApiFormat::Anthropic), "/v1/messages");
        assert_eq!(endpoint_path(ApiFormat::OpenAI), "/v1/chat/completions");
    }
}
