//! Health / heartbeat endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health))]
pub struct HealthApi;

/// Register health-check routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Heartbeat endpoint.
///
/// Returns `{"status": "ok", "version": "...", "fanout": {...}}` with HTTP 200.
/// The `fanout` counters show how many side-effect jobs completed, were given
/// up after retries, or were dropped on a full queue.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = Value)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status":  "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "fanout":  state.fanout.stats(),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::testing::{self, RecordingIndex, ScriptedBackend};

    #[tokio::test]
    async fn health_reports_version_and_fanout_counters() {
        let app = testing::test_app(
            Arc::new(ScriptedBackend::replying(&[])),
            Arc::new(RecordingIndex::default()),
            Config::default(),
        )
        .await;

        let Json(body) = get_health(State(app.state.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        for counter in ["completed", "failed", "dropped"] {
            assert_eq!(body["fanout"][counter], 0, "fanout.{counter}");
        }
    }
}
