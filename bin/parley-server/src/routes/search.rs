use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::search::{SearchHitResponse, SearchQuery};
use crate::state::AppState;

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 100;

#[derive(OpenApi)]
#[openapi(paths(search_messages), components(schemas(SearchHitResponse)))]
pub struct SearchApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/search", get(search_messages))
}

/// Full-text search over stored messages.
///
/// The index is fed asynchronously, so a message may show up here a moment
/// after its turn completed.
#[utoipa::path(
    get,
    path = "/search",
    tag = "search",
    params(SearchQuery),
    responses(
        (status = 200, description = "Best matches first", body = Vec<SearchHitResponse>),
        (status = 400, description = "Missing or blank query, or a malformed limit"),
        (status = 503, description = "Search index unavailable"),
    )
)]
pub async fn search_messages(
    State(state): State<Arc<AppState>>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<Vec<SearchHitResponse>>, ServerError> {
    let Query(query) = query?;
    let q = query.q.as_deref().map(str::trim).unwrap_or_default();
    if q.is_empty() {
        return Err(ServerError::BadRequest("q must not be empty".into()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let hits = state.search.search(q, limit).await?;
    Ok(Json(hits.into_iter().map(SearchHitResponse::from).collect()))
}
