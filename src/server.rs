//! HTTP server
//!
//! The axum router and the thin handlers around the proxy engine:
//! authentication, body caps, the cache header, stream sessions, health
//! and model listing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::FutureExt;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::config::{self, Settings};
use crate::error::ProxyError;
use crate::proxy::{ProxyEngine, ProxyOutcome};
use crate::session::SessionRegistry;
use crate::store::{BudgetStore, FingerprintStore, PiiLogger, SqliteStore};

/// Cache-status header set on every proxied response.
const CACHE_HEADER: &str = "x-tokenman-cache";

pub struct AppState {
    settings: RwLock<Arc<Settings>>,
    engine: RwLock<Arc<ProxyEngine>>,
    sessions: SessionRegistry,
    fingerprints: Arc<dyn FingerprintStore>,
    budgets: Arc<dyn BudgetStore>,
    pii_logger: Option<Arc<dyn PiiLogger>>,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        fingerprints: Arc<dyn FingerprintStore>,
        budgets: Arc<dyn BudgetStore>,
        pii_logger: Option<Arc<dyn PiiLogger>>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            settings: RwLock::new(Arc::new(settings.clone())),
            engine: RwLock::new(Arc::new(ProxyEngine::new(
                settings,
                fingerprints.clone(),
                budgets.clone(),
                pii_logger.clone(),
            ))),
            sessions: SessionRegistry::new(settings.server.max_stream_sessions),
            fingerprints,
            budgets,
            pii_logger,
        })
    }

    pub fn engine(&self) -> Arc<ProxyEngine> {
        self.engine.read().expect("engine lock").clone()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.read().expect("settings lock").clone()
    }

    /// Swap in a freshly built engine after a settings reload.
    pub fn rebuild(&self, settings: &Settings) {
        let engine = Arc::new(ProxyEngine::new(
            settings,
            self.fingerprints.clone(),
            self.budgets.clone(),
            self.pii_logger.clone(),
        ));
        *self.engine.write().expect("engine lock") = engine;
        *self.settings.write().expect("settings lock") = Arc::new(settings.clone());
    }
}

/// Bearer-token check for the proxy endpoints: 401 when the token is
/// missing, 403 when it doesn't match. Comparison is constant time.
fn check_auth(headers: &HeaderMap, settings: &Settings) -> Result<(), ProxyError> {
    let Some(expected) = settings
        .server
        .auth_token
        .as_deref()
        .filter(|t| !t.is_empty())
    else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let Some(presented) = presented else {
        return Err(ProxyError::Unauthorized(
            "missing bearer token".to_string(),
        ));
    };
    let matches = presented.len() == expected.len()
        && presented.as_bytes().ct_eq(expected.as_bytes()).into();
    if matches {
        Ok(())
    } else {
        Err(ProxyError::Forbidden("invalid bearer token".to_string()))
    }
}

/// Lowercased client headers, minus hop-by-hop noise.
fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            if name == "host" || name == "content-length" || name == "connection" {
                return None;
            }
            value
                .to_str()
                .ok()
                .map(|value| (name, value.to_string()))
        })
        .collect()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn receiver_stream(
    rx: tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>>,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

fn sse_response(status: u16, body: Body, cache: &str) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .header(CACHE_HEADER, cache)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Core proxy handler shared by both dialect endpoints.
async fn proxy(
    path: &'static str,
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let settings = state.settings();
    if let Err(e) = check_auth(&headers, &settings) {
        return e.into_response();
    }
    if body.len() > settings.server.max_body_size {
        return ProxyError::BodyTooLarge(settings.server.max_body_size).into_response();
    }

    let client_headers = collect_headers(&headers);
    let cancel = CancellationToken::new();
    // dropped mid-flight (client disconnect) => downstream work cancels
    let guard = cancel.clone().drop_guard();
    let engine = state.engine();

    let outcome = std::panic::AssertUnwindSafe(engine.handle(
        path,
        client_headers,
        &body,
        cancel.clone(),
    ))
    .catch_unwind()
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(payload) => {
            return ProxyError::PipelineInternal(format!(
                "panic in request handler: {}",
                panic_message(payload)
            ))
            .into_response();
        }
    };

    match outcome {
        Ok(ProxyOutcome::Complete {
            response,
            cache_hit,
            content_type,
        }) => {
            guard.disarm();
            Response::builder()
                .status(
                    StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK),
                )
                .header("content-type", content_type)
                .header(CACHE_HEADER, if cache_hit { "HIT" } else { "MISS" })
                .body(Body::from(response.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(ProxyOutcome::Stream { status, events }) => {
            // the pump notices client disconnects through the closed
            // channel; the accumulated partial still gets accounted
            guard.disarm();
            sse_response(status, Body::from_stream(receiver_stream(events)), "MISS")
        }
        Err(e) => e.into_response(),
    }
}

async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy("/v1/messages", state, headers, body).await
}

async fn openai_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy("/v1/chat/completions", state, headers, body).await
}

/// Proxy the models listing from the first enabled provider.
async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let settings = state.settings();
    if let Err(e) = check_auth(&headers, &settings) {
        return e.into_response();
    }
    let Some(provider) = settings.providers.iter().find(|p| p.enabled) else {
        return ProxyError::RequestFailed("no enabled provider".to_string()).into_response();
    };
    let url = format!("{}/v1/models", provider.base_url.trim_end_matches('/'));
    let mut builder = crate::upstream::forward::client().get(&url);
    if !provider.api_key.is_empty() {
        builder = match provider.format {
            config::ApiFormat::Anthropic => builder.header("x-api-key", &provider.api_key),
            config::ApiFormat::OpenAI => {
                builder.header("authorization", format!("Bearer {}", provider.api_key))
            }
        };
    }
    match builder.send().await {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response.bytes().await.unwrap_or_default();
            Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(e) => ProxyError::RequestFailed(e.to_string()).into_response(),
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn health_ready(State(state): State<Arc<AppState>>) -> Response {
    let settings = state.settings();
    let ready = settings.providers.iter().any(|p| p.enabled);
    if ready {
        Json(json!({"status": "ready"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "no enabled providers"})),
        )
            .into_response()
    }
}

// ============================================================================
// Stream session endpoints
// ============================================================================

async fn stream_create(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let settings = state.settings();
    if let Err(e) = check_auth(&headers, &settings) {
        return e.into_response();
    }
    match state.sessions.create() {
        Some(session) => (
            StatusCode::CREATED,
            Json(json!({"session_id": session.id})),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"type": "proxy_error", "message": "stream session limit reached"}})),
        )
            .into_response(),
    }
}

/// Run one request through the normal pipeline, publishing its SSE
/// events into the session.
async fn stream_send(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let settings = state.settings();
    if let Err(e) = check_auth(&headers, &settings) {
        return e.into_response();
    }
    let Some(session) = state.sessions.get(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"type": "proxy_error", "message": "unknown stream session"}})),
        )
            .into_response();
    };

    // session requests always stream upstream
    let mut payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return ProxyError::MalformedBody(e.to_string()).into_response(),
    };
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("stream".to_string(), Value::Bool(true));
    }
    let body = serde_json::to_vec(&payload).unwrap_or_else(|_| body.to_vec());

    let engine = state.engine();
    let outcome = engine
        .handle(
            "/v1/messages",
            collect_headers(&headers),
            &body,
            CancellationToken::new(),
        )
        .await;

    match outcome {
        Ok(ProxyOutcome::Stream { mut events, .. }) => {
            tokio::spawn(async move {
                while let Some(frame) = events.recv().await {
                    match frame {
                        Ok(bytes) => session.publish(bytes),
                        Err(_) => break,
                    }
                }
            });
            (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
        }
        Ok(ProxyOutcome::Complete { response, .. }) => {
            let frame = format!(
                "data: {}\n\n",
                String::from_utf8_lossy(&response.body)
            );
            session.publish(Bytes::from(frame));
            (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn stream_events(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let settings = state.settings();
    if let Err(e) = check_auth(&headers, &settings) {
        return e.into_response();
    }
    let Some(session) = state.sessions.get(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"type": "proxy_error", "message": "unknown stream session"}})),
        )
            .into_response();
    };
    sse_response(200, Body::from_stream(session.subscribe()), "MISS")
}

async fn stream_delete(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> StatusCode {
    if state.sessions.remove(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::permissive();
    let max_body = state.settings().server.max_body_size;
    Router::new()
        // Health
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        // ============================================================
        // Proxy endpoints (the two recognized dialects)
        // ============================================================
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/models", get(list_models))
        // ============================================================
        // Stream sessions
        // ============================================================
        .route("/v1/stream/create", post(stream_create))
        .route("/v1/stream/:id/send", post(stream_send))
        .route("/v1/stream/:id/events", get(stream_events))
        .route("/v1/stream/:id", delete(stream_delete))
        .layer(DefaultBodyLimit::max(max_body.max(1)))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve() -> Result<(), String> {
    let settings = config::load();

    let mut db_path = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    db_path.push("TokenMan");
    std::fs::create_dir_all(&db_path).ok();
    db_path.push("tokenman.db");
    let store = Arc::new(
        SqliteStore::open(db_path).map_err(|e| format!("failed to open store: {e}"))?,
    );

    let state = AppState::new(
        &settings,
        store.clone(),
        store.clone(),
        Some(store.clone() as Arc<dyn PiiLogger>),
    );
    {
        let state = state.clone();
        config::on_reload(move |settings| state.rebuild(settings));
    }

    let addr: std::net::SocketAddr = settings
        .server
        .listen
        .parse()
        .map_err(|e| format!("invalid listen address '{}': {e}", settings.server.listen))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    tracing::info!(target: "tokenman::server", %addr, "listening");
    axum::serve(listener, app(state))
        .await
        .map_err(|e| format!("server error: {e}"))
}
