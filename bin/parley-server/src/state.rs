//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::config::Config;
use crate::entities::SqliteStore;
use crate::services::fanout::FanoutHandle;
use crate::services::registry::ModelRegistry;
use crate::services::search::SearchIndex;
use crate::services::turn::TurnCoordinator;

/// State shared across all HTTP handlers.
///
/// Every collaborator is constructed explicitly in `main` (or by the test
/// fixtures) and closed there; nothing here is a global.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Chats, messages, users and the model catalog.
    pub store: Arc<SqliteStore>,
    /// Cached view of the model catalog.
    pub registry: Arc<ModelRegistry>,
    /// Full-text index; read directly by `/search`, written only by fan-out.
    pub search: Arc<dyn SearchIndex>,
    pub turns: Arc<TurnCoordinator>,
    pub fanout: FanoutHandle,
}
