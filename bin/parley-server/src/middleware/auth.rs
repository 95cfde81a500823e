use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::error::ServerError;
use crate::state::AppState;

/// Require `Authorization: Bearer <PARLEY_ADMIN_TOKEN>` when a token is
/// configured.  Without one the admin routes are open.
pub async fn check_admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(expected_token) = state.config.admin_token.as_deref() {
        let provided = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(token) if bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())) => {}
            _ => return ServerError::Unauthorized("unauthorised".into()).into_response(),
        }
    }
    next.run(req).await
}
