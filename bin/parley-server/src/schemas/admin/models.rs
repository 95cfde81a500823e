use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::entities::{ModelDescriptor, format_ts};

#[derive(Debug, Clone, Deserialize, ToSchema, Validate)]
pub struct RegisterModelRequest {
    /// Name understood by the inference backend, e.g. `"qwen2.5:7b"`.
    #[validate(length(min = 1, max = 200))]
    pub model_name: String,
    #[validate(length(min = 1, max = 100))]
    pub label: String,
    #[validate(length(max = 500))]
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelCatalogResponse {
    pub model_name: String,
    pub label: String,
    pub description: String,
    pub usage_count: i64,
    pub last_used_at: Option<String>,
    pub created_at: String,
}

impl RegisterModelRequest {
    /// Trimmed copy; validation runs on the result.
    pub fn normalized(&self) -> Self {
        Self {
            model_name: self.model_name.trim().to_owned(),
            label: self.label.trim().to_owned(),
            description: self.description.trim().to_owned(),
        }
    }
}

impl From<ModelDescriptor> for ModelCatalogResponse {
    fn from(m: ModelDescriptor) -> Self {
        ModelCatalogResponse {
            model_name: m.model_name,
            label: m.label,
            description: m.description,
            usage_count: m.usage_count,
            last_used_at: m.last_used_at.as_ref().map(format_ts),
            created_at: format_ts(&m.created_at),
        }
    }
}
