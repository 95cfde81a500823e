use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::ModelDescriptor;

/// Entry of `GET /models`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelResponse {
    pub model_name: String,
    pub label: String,
    pub description: String,
}

impl ModelDescriptor {
    pub fn to_response(&self) -> ModelResponse {
        ModelResponse {
            model_name: self.model_name.clone(),
            label: self.label.clone(),
            description: self.description.clone(),
        }
    }
}
