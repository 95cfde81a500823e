//! parley-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON or pretty console, optional daily log files).
//! 3. Open the SQLite store, run pending migrations and seed the model catalog.
//! 4. Open the search index and start the fan-out worker.
//! 5. Connect the inference backend and wire the turn coordinator.
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod entities;
mod error;
mod middleware;
mod routes;
mod schemas;
mod seed;
mod services;
mod state;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::Config;
use crate::entities::SqliteStore;
use crate::services::cache::MemoryCache;
use crate::services::fanout::{Fanout, FanoutConfig};
use crate::services::inference::OllamaBackend;
use crate::services::registry::ModelRegistry;
use crate::services::search::{SearchIndex, SqliteSearchIndex};
use crate::services::turn::{TurnCoordinator, TurnSettings};
use crate::state::AppState;

const FANOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = init_tracing(&cfg)?;

    info!(version = env!("CARGO_PKG_VERSION"), "parley-server starting");

    // ── 3. Primary store ───────────────────────────────────────────────────────
    let store = Arc::new(SqliteStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    if cfg.seed_models {
        seed::seed_models_if_empty(&store).await?;
    }

    // ── 4. Search index, model registry and fan-out ────────────────────────────
    let search_index = Arc::new(SqliteSearchIndex::connect(&cfg.search_url).await?);
    info!(search_url = %cfg.search_url, "search index ready");
    let search: Arc<dyn SearchIndex> = search_index.clone();

    let registry = Arc::new(ModelRegistry::new(
        store.clone(),
        Arc::new(MemoryCache::new()),
        cfg.model_cache_ttl,
    ));

    let (fanout, fanout_worker) = Fanout::start(
        search.clone(),
        registry.clone(),
        FanoutConfig {
            queue: cfg.fanout_queue,
            max_attempts: cfg.fanout_max_attempts,
            ..FanoutConfig::default()
        },
    );

    // ── 5. Inference backend and turn coordinator ──────────────────────────────
    let backend = Arc::new(OllamaBackend::connect(
        &cfg.inference_url,
        cfg.inference_connect_timeout,
    )?);
    info!(inference_url = %cfg.inference_url, "inference backend configured");

    let turns = Arc::new(TurnCoordinator::new(
        store.clone(),
        backend,
        registry.clone(),
        fanout.clone(),
        TurnSettings {
            relay_buffer: cfg.relay_buffer,
            partial_reply_policy: cfg.partial_reply_policy,
        },
    ));

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        store: store.clone(),
        registry,
        search,
        turns,
        fanout,
    });

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Handlers are gone; let queued index and usage updates finish first.
    drop(state);
    fanout_worker.shutdown(FANOUT_DRAIN_TIMEOUT).await;
    search_index.close().await;
    store.close().await;

    info!("parley-server stopped");
    Ok(())
}

/// Install the global subscriber.  The returned guard flushes the file
/// writer on drop and must live until `main` returns.
fn init_tracing(cfg: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: PARLEY_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                EnvFilter::new("info")
            }
        },
    };

    let console = if cfg.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let (file, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "parley-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .try_init()?;
    Ok(guard)
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
