use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row in the `models` catalog.
///
/// Serializable because the model registry caches the whole list as one
/// JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_name: String,
    pub label: String,
    pub description: String,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ModelDescriptor {
    pub fn new(
        model_name: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            label: label.into(),
            description: description.into(),
            usage_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}
