//! TokenMan: a local reverse proxy between application code and LLM
//! provider APIs.
//!
//! Requests in the two recognized wire dialects are normalized, run
//! through an ordered chain of transforming middlewares (dedup,
//! heartbeat, history compression, text rules, PII, injection, rate
//! limiting, budgets), forwarded to a provider behind a circuit breaker
//! and retry engine, and the response is run back through the chain in
//! reverse to restore per-request state and record accounting.

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod pricing;
pub mod proxy;
pub mod server;
pub mod session;
pub mod store;
pub mod upstream;

pub use error::{ProxyError, ProxyResult};

/// Install a panic hook that logs panics before the recovery layers
/// translate them into error responses.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        tracing::error!(
            target: "tokenman::panic",
            %message,
            %location,
            "panic recovered"
        );
    }));
}
