use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::routing::post;
use axum::{Json, Router};
use tracing::info;
use utoipa::OpenApi;
use validator::Validate;

use crate::entities::UserStore;
use crate::error::ServerError;
use crate::schemas::auth::{LoginRequest, LoginResponse, Preferences, UserResponse};
use crate::seed::verify_password;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(login),
    components(schemas(LoginRequest, LoginResponse, UserResponse, Preferences))
)]
pub struct AuthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/login", post(login))
}

/// Check a username and password and return the user's public profile.
///
/// Unknown users and wrong passwords get the same 401.
#[utoipa::path(
    post,
    path = "/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Credentials accepted", body = LoginResponse),
        (status = 400, description = "Missing fields"),
        (status = 401, description = "Invalid username or password"),
    )
)]
pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ServerError> {
    let Json(req) = payload?;
    req.validate()?;

    let rejected = || ServerError::Unauthorized("invalid username or password".into());
    let user = state
        .store
        .find_user_by_username(&req.username)
        .await?
        .ok_or_else(rejected)?;

    let password = req.password;
    let digest = user.password_digest.clone();
    let matched = tokio::task::spawn_blocking(move || verify_password(&password, &digest))
        .await
        .map_err(|e| ServerError::Internal(format!("password check aborted: {e}")))?;
    if !matched {
        return Err(rejected());
    }

    info!(user_id = %user.id, "user logged in");
    Ok(Json(LoginResponse {
        user: user.to_response(),
    }))
}
