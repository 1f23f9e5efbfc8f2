//! Settings and configuration snapshot
//!
//! Settings are read from a TOML file and held as an atomically swappable
//! `Arc<Settings>` snapshot. Readers always see one consistent snapshot;
//! hot-reload swaps the pointer and notifies registered callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::{fs, path::PathBuf};

use once_cell::sync::Lazy;

/// Wire dialect of a provider API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    Anthropic,
    OpenAI,
}

impl Default for ApiFormat {
    fn default() -> Self {
        ApiFormat::Anthropic
    }
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::Anthropic => "anthropic",
            ApiFormat::OpenAI => "openai",
        }
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One configured upstream provider.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    /// API key for this provider. If empty, client credentials pass through.
    pub api_key: String,
    pub format: ApiFormat,
    /// Models this provider serves. Empty means "accepts anything".
    pub models: Vec<String>,
    pub enabled: bool,
    /// Lower value wins when several providers support a model.
    pub priority: i32,
    /// Per-attempt timeout in seconds for non-streaming requests.
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Optional bearer token protecting the proxy endpoints.
    pub auth_token: Option<String>,
    pub max_body_size: usize,
    pub max_response_size: usize,
    pub max_stream_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            auth_token: None,
            max_body_size: 10 * 1024 * 1024,
            max_response_size: 50 * 1024 * 1024,
            max_stream_sessions: 64,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Explicit model → provider-name mapping, consulted first.
    pub model_map: HashMap<String, String>,
    pub default_provider: Option<String>,
    /// When true, all other enabled providers form a fallback list.
    pub fallback: bool,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// A repeat within this window counts as provider-cache eligible.
    pub ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Model substituted for requests classified as heartbeats.
    pub heartbeat_model: Option<String>,
    pub dedup_window_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_model: None,
            dedup_window_secs: 60,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Number of most recent messages kept verbatim.
    pub window_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 20,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct RulesConfig {
    pub collapse_whitespace: bool,
    pub minify_json: bool,
    pub minify_xml: bool,
    pub strip_markdown: bool,
    pub dedup_instructions: bool,
}

impl RulesConfig {
    /// The middleware is enabled when any single rule is switched on.
    pub fn any_enabled(&self) -> bool {
        self.collapse_whitespace
            || self.minify_json
            || self.minify_xml
            || self.strip_markdown
            || self.dedup_instructions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiAction {
    Redact,
    Hash,
    Log,
    Block,
}

impl Default for PiiAction {
    fn default() -> Self {
        PiiAction::Redact
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PiiConfig {
    pub enabled: bool,
    pub action: PiiAction,
    /// Exact match strings that bypass detection.
    pub allowlist: Vec<String>,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            action: PiiAction::Redact,
            allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionAction {
    Log,
    Sanitize,
    Block,
}

impl Default for InjectionAction {
    fn default() -> Self {
        InjectionAction::Log
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct InjectionConfig {
    pub enabled: bool,
    pub action: InjectionAction,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            action: InjectionAction::Log,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct BucketConfig {
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Maximum burst size.
    pub burst: u32,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_rate: f64,
    pub default_burst: u32,
    /// Per-provider bucket overrides keyed by provider name.
    pub providers: HashMap<String, BucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rate: 10.0,
            default_burst: 20,
            providers: HashMap::new(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BudgetConfig {
    pub enabled: bool,
    /// Zero means no limit for that period.
    pub hourly_usd: f64,
    pub daily_usd: f64,
    pub monthly_usd: f64,
    /// Fractions of a limit at which an alert is recorded.
    pub alert_thresholds: Vec<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hourly_usd: 0.0,
            daily_usd: 0.0,
            monthly_usd: 0.0,
            alert_thresholds: vec![0.5, 0.8, 0.95],
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 300,
            max_ms: 3000,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30,
            half_open_max: 2,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StreamingConfig {
    /// Byte cap on the SSE accumulator; 0 means unlimited.
    pub max_accumulator_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_accumulator_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub providers: Vec<ProviderConfig>,
    pub router: RouterConfig,
    pub dedup: DedupConfig,
    pub heartbeat: HeartbeatConfig,
    pub history: HistoryConfig,
    pub rules: RulesConfig,
    pub pii: PiiConfig,
    pub injection: InjectionConfig,
    pub ratelimit: RateLimitConfig,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub streaming: StreamingConfig,
}

impl Settings {
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// Snapshot management
// ============================================================================

type ReloadHook = Box<dyn Fn(&Arc<Settings>) + Send + Sync>;

static CURRENT: Lazy<RwLock<Arc<Settings>>> =
    Lazy::new(|| RwLock::new(Arc::new(Settings::default())));
static RELOAD_HOOKS: Lazy<Mutex<Vec<ReloadHook>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Current settings snapshot. Cheap to call; the Arc is cloned, never the
/// settings themselves.
pub fn load() -> Arc<Settings> {
    CURRENT.read().expect("settings lock poisoned").clone()
}

/// Swap in a new snapshot and notify registered reload callbacks.
pub fn replace(next: Settings) -> Arc<Settings> {
    let next = Arc::new(next);
    {
        let mut current = CURRENT.write().expect("settings lock poisoned");
        *current = next.clone();
    }
    let hooks = RELOAD_HOOKS.lock().expect("hooks lock poisoned");
    for hook in hooks.iter() {
        hook(&next);
    }
    next
}

/// Register a callback invoked after every snapshot swap.
pub fn on_reload(hook: impl Fn(&Arc<Settings>) + Send + Sync + 'static) {
    RELOAD_HOOKS
        .lock()
        .expect("hooks lock poisoned")
        .push(Box::new(hook));
}

fn settings_path() -> PathBuf {
    if let Ok(path) = std::env::var("TOKENMAN_CONFIG") {
        return PathBuf::from(path);
    }
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("TokenMan");
    fs::create_dir_all(&p).ok();
    p.push("settings.toml");
    p
}

/// Parse settings from a TOML file.
pub fn load_from_path(path: &std::path::Path) -> Result<Settings, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("failed to read settings file {:?}: {}", path, e))?;
    toml::from_str(&raw).map_err(|e| format!("failed to parse settings file {:?}: {}", path, e))
}

/// Load settings from disk (or defaults when absent) and install them as
/// the current snapshot.
pub fn init_from_disk() -> Arc<Settings> {
    let p = settings_path();
    let cfg = if p.exists() {
        match load_from_path(&p) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(target: "tokenman::config", "{e}; using defaults");
                Settings::default()
            }
        }
    } else {
        tracing::info!(target: "tokenman::config", path = ?p, "no settings file, using defaults");
        Settings::default()
    };
    replace(cfg)
}

pub fn save(cfg: &Settings) -> Result<(), String> {
    let p = settings_path();
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create config directory: {}", e))?;
    }
    let s = toml::to_string_pretty(cfg).map_err(|e| format!("failed to serialize config: {}", e))?;
    fs::write(&p, &s).map_err(|e| format!("failed to write config file to {:?}: {}", p, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = Settings::default();
        assert!(cfg.dedup.enabled);
        assert_eq!(cfg.history.window_size, 20);
        assert!(!cfg.rules.any_enabled());
        assert_eq!(cfg.pii.action, PiiAction::Redact);
    }

    #[test]
    fn toml_roundtrip_with_partial_file() {
        let raw = r#"
            [[providers]]
            name = "anthropic"
            base_url = "https://api.anthropic.com"
            format = "anthropic"
            enabled = true
            models = ["claude-sonnet-4-20250514"]

            [history]
            window_size = 4
        "#;
        let cfg: Settings = toml::from_str(raw).unwrap();
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers[0].format, ApiFormat::Anthropic);
        assert_eq!(cfg.history.window_size, 4);
        // untouched sections come back as defaults
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn replace_notifies_hooks() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        on_reload(|_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        });
        replace(Settings::default());
        assert!(CALLS.load(Ordering::SeqCst) >= 1);
    }
}
