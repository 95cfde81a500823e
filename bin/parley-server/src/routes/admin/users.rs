use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use tracing::info;
use utoipa::OpenApi;
use uuid::Uuid;
use validator::Validate;

use crate::entities::{UserRecord, UserStore, is_unique_violation};
use crate::error::ServerError;
use crate::schemas::admin::users::CreateUserRequest;
use crate::schemas::auth::UserResponse;
use crate::seed::hash_password;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(create_user), components(schemas(CreateUserRequest)))]
pub struct UsersAdminApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/users", post(create_user))
}

/// Create a user account.
#[utoipa::path(
    post,
    path = "/admin/users",
    tag = "admin",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = UserResponse),
        (status = 400, description = "Invalid fields"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 409, description = "Username or email taken"),
    )
)]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserResponse>), ServerError> {
    let Json(req) = payload?;
    req.validate()?;

    let password = req.password;
    let password_digest = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| ServerError::Internal(format!("password hashing aborted: {e}")))?
        .map_err(|e| ServerError::Internal(format!("password hashing failed: {e}")))?;

    let user = UserRecord {
        id: Uuid::new_v4().to_string(),
        username: req.username.trim().to_owned(),
        email: req.email,
        password_digest,
        default_model: req.default_model,
        theme: req.theme,
        created_at: Utc::now(),
    };

    if let Err(e) = state.store.insert_user(user.clone()).await {
        if is_unique_violation(&e) {
            return Err(ServerError::Conflict("username or email already taken".into()));
        }
        return Err(e.into());
    }

    info!(user_id = %user.id, username = %user.username, "user created");
    Ok((StatusCode::CREATED, Json(user.to_response())))
}
