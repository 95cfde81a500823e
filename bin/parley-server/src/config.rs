//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

/// What happens to assistant content that was already relayed when a turn
/// fails mid-stream or the client disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialReplyPolicy {
    /// Store the relayed prefix as the assistant message.
    Persist,
    /// Store nothing for the assistant side of a failed turn.
    Discard,
}

/// Runtime configuration for parley-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// Primary store URL (default: `"sqlite://parley.db"`).
    pub database_url: String,

    /// Full-text index store URL (default: `"sqlite://parley-search.db"`).
    /// Kept separate from the primary store so an unusable index never takes
    /// the chat path down with it.
    pub search_url: String,

    /// Base URL of the Ollama-compatible inference backend.
    pub inference_url: String,

    /// Connect timeout for the inference backend.
    pub inference_connect_timeout: Duration,

    /// TTL of the cached model list.
    pub model_cache_ttl: Duration,

    /// Whether `POST /chats/{id}/messages` streams when the body does not say.
    pub stream_by_default: bool,

    /// Partial-reply policy for failed or abandoned turns.
    pub partial_reply_policy: PartialReplyPolicy,

    /// Depth of the bounded queue between the backend stream and the client.
    pub relay_buffer: usize,

    /// Depth of the bounded fan-out job queue.
    pub fanout_queue: usize,

    /// Attempts per fan-out job before it is given up and logged.
    pub fanout_max_attempts: u32,

    /// Bearer token guarding `/admin`; the admin routes are open when unset.
    pub admin_token: Option<String>,

    /// Comma-separated CORS allow-list; wildcard when unset.
    pub cors_allowed_origins: Option<String>,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`.
    pub enable_docs: bool,

    /// Seed the default model catalog when it is empty.
    pub seed_models: bool,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit console log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily-rolling JSON log files; file logging is off when unset.
    pub log_dir: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("PARLEY_BIND", "0.0.0.0:3000"),
            database_url: env_or("PARLEY_DATABASE_URL", "sqlite://parley.db"),
            search_url: env_or("PARLEY_SEARCH_URL", "sqlite://parley-search.db"),
            inference_url: env_or("PARLEY_INFERENCE_URL", "http://localhost:11434"),
            inference_connect_timeout: Duration::from_secs(parse_env(
                "PARLEY_INFERENCE_CONNECT_TIMEOUT_SECS",
                10,
            )),
            model_cache_ttl: Duration::from_secs(parse_env("PARLEY_MODEL_CACHE_TTL_SECS", 300)),
            stream_by_default: bool_env("PARLEY_STREAM_BY_DEFAULT", true),
            partial_reply_policy: if bool_env("PARLEY_PERSIST_PARTIAL", true) {
                PartialReplyPolicy::Persist
            } else {
                PartialReplyPolicy::Discard
            },
            relay_buffer: parse_env("PARLEY_RELAY_BUFFER", 8usize).max(1),
            fanout_queue: parse_env("PARLEY_FANOUT_QUEUE", 256usize).max(1),
            fanout_max_attempts: parse_env("PARLEY_FANOUT_MAX_ATTEMPTS", 3u32).max(1),
            admin_token: non_empty_env("PARLEY_ADMIN_TOKEN"),
            cors_allowed_origins: non_empty_env("PARLEY_CORS_ORIGINS"),
            enable_docs: bool_env("PARLEY_ENABLE_DOCS", true),
            seed_models: bool_env("PARLEY_SEED_MODELS", true),
            log_level: env_or("PARLEY_LOG", "info"),
            log_json: bool_env("PARLEY_LOG_JSON", false),
            log_dir: non_empty_env("PARLEY_LOG_DIR"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".into(),
            database_url: "sqlite://parley.db".into(),
            search_url: "sqlite://parley-search.db".into(),
            inference_url: "http://localhost:11434".into(),
            inference_connect_timeout: Duration::from_secs(10),
            model_cache_ttl: Duration::from_secs(300),
            stream_by_default: true,
            partial_reply_policy: PartialReplyPolicy::Persist,
            relay_buffer: 8,
            fanout_queue: 256,
            fanout_max_attempts: 3,
            admin_token: None,
            cors_allowed_origins: None,
            enable_docs: true,
            seed_models: true,
            log_level: "info".into(),
            log_json: false,
            log_dir: None,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn bool_env(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
