use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::services::search::SearchHit;

#[derive(Debug, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct SearchQuery {
    /// Words to look for; every word must match.
    pub q: Option<String>,
    /// Maximum number of hits (default 20, at most 100).
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SearchHitResponse {
    /// Message id.
    pub id: String,
    pub chat_id: String,
    pub content: String,
}

impl From<SearchHit> for SearchHitResponse {
    fn from(hit: SearchHit) -> Self {
        SearchHitResponse {
            id: hit.id,
            chat_id: hit.chat_id,
            content: hit.content,
        }
    }
}
