//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! Internal errors (database, unclassified) are logged with full detail but
//! only a generic message is returned to the caller, so SQL or other
//! implementation details never leak to clients.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::services::inference::InferenceError;
use crate::services::search::IndexError;
use crate::services::turn::TurnError;

/// All errors that can occur in the parley-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the primary store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The inference backend failed or refused the request.
    #[error("upstream error: {0}")]
    Upstream(#[from] InferenceError),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Bad credentials or a missing admin token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The resource already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The full-text index cannot serve queries right now.
    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            // Client-facing errors: expose the message directly.
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            ServerError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),

            ServerError::SearchUnavailable(m) => {
                warn!(message = %m, "search index unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "search is temporarily unavailable".to_owned(),
                )
            }
            ServerError::Upstream(e) => {
                warn!(error = %e, "inference backend error");
                let message = match e {
                    InferenceError::Transport(_) => "inference backend unreachable".to_owned(),
                    InferenceError::Status { status, .. } => {
                        format!("inference backend rejected the request ({status})")
                    }
                    InferenceError::Stream(reason) => format!("inference failed: {reason}"),
                };
                (StatusCode::BAD_GATEWAY, message)
            }
            ServerError::Database(e) => {
                error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<TurnError> for ServerError {
    fn from(e: TurnError) -> Self {
        match e {
            TurnError::Validation(m) => ServerError::BadRequest(m),
            TurnError::NotFound(m) => ServerError::NotFound(m),
            TurnError::Upstream(e) => ServerError::Upstream(e),
            TurnError::Persistence(e) => ServerError::Database(e),
            TurnError::Aborted(m) => ServerError::Internal(m),
        }
    }
}

impl From<IndexError> for ServerError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::EmptyQuery => ServerError::BadRequest("query must not be empty".into()),
            IndexError::Unavailable(e) => ServerError::SearchUnavailable(e.to_string()),
        }
    }
}

/// Malformed or missing JSON bodies are a plain 400.
impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

/// So is a query string that does not deserialize.
impl From<QueryRejection> for ServerError {
    fn from(rejection: QueryRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl From<validator::ValidationErrors> for ServerError {
    fn from(e: validator::ValidationErrors) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}
