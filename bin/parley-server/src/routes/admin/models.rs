use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use tracing::info;
use utoipa::OpenApi;
use validator::Validate;

use crate::entities::{ModelDescriptor, ModelStore, is_unique_violation};
use crate::error::ServerError;
use crate::schemas::admin::models::{ModelCatalogResponse, RegisterModelRequest};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(register_model, list_catalog, delete_model),
    components(schemas(RegisterModelRequest, ModelCatalogResponse))
)]
pub struct ModelsAdminApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", post(register_model).get(list_catalog))
        .route("/models/{name}", delete(delete_model))
}

/// Add a model to the catalog.  The cached model list is refreshed.
#[utoipa::path(
    post,
    path = "/admin/models",
    tag = "admin",
    request_body = RegisterModelRequest,
    responses(
        (status = 201, description = "Model registered", body = ModelCatalogResponse),
        (status = 400, description = "Invalid fields"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 409, description = "Model name already registered"),
    )
)]
pub async fn register_model(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterModelRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ModelCatalogResponse>), ServerError> {
    let Json(req) = payload?;
    let req = req.normalized();
    req.validate()?;

    let model = ModelDescriptor::new(req.model_name, req.label, req.description);
    match state.registry.register_model(model.clone()).await {
        Ok(()) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(ServerError::Conflict(format!(
                "model {} is already registered",
                model.model_name
            )));
        }
        Err(e) => return Err(e.into()),
    }

    info!(model = %model.model_name, "model registered");
    Ok((StatusCode::CREATED, Json(model.into())))
}

/// Full catalog including usage counters.  Reads the store, not the cache.
#[utoipa::path(
    get,
    path = "/admin/models",
    tag = "admin",
    responses(
        (status = 200, description = "Catalog entries", body = Vec<ModelCatalogResponse>),
        (status = 401, description = "Missing or wrong admin token"),
    )
)]
pub async fn list_catalog(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ModelCatalogResponse>>, ServerError> {
    let models = state.store.list_models().await?;
    Ok(Json(models.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    delete,
    path = "/admin/models/{name}",
    tag = "admin",
    params(("name" = String, Path, description = "Catalog model name")),
    responses(
        (status = 204, description = "Model removed"),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 404, description = "Model not found"),
    )
)]
pub async fn delete_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ServerError> {
    if !state.registry.delete_model(&name).await? {
        return Err(ServerError::NotFound(format!("model {name} not found")));
    }
    info!(model = %name, "model removed");
    Ok(StatusCode::NO_CONTENT)
}
