use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::models::ModelResponse;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(list_models), components(schemas(ModelResponse)))]
pub struct ModelsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/models", get(list_models))
}

/// Models a chat can be started with.  Served from the registry cache.
#[utoipa::path(
    get,
    path = "/models",
    tag = "models",
    responses(
        (status = 200, description = "Model catalog", body = Vec<ModelResponse>),
        (status = 500, description = "Catalog unavailable"),
    )
)]
pub async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModelResponse>>, ServerError> {
    let models = state.registry.get_models().await?;
    Ok(Json(models.iter().map(|m| m.to_response()).collect()))
}
