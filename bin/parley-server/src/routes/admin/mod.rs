pub mod models;
pub mod users;

use crate::middleware::auth;
use crate::state::AppState;

use axum::{Router, middleware};
use std::sync::Arc;
use utoipa::OpenApi;

// Routes nested under `/admin` (model catalog, users).
pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(models::router())
        .merge(users::router())
        .route_layer(middleware::from_fn_with_state(state, auth::check_admin_auth))
}

#[derive(OpenApi)]
#[openapi()]
pub struct AdminApi;

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut doc = AdminApi::openapi();
    doc.merge(models::ModelsAdminApi::openapi());
    doc.merge(users::UsersAdminApi::openapi());
    doc
}
