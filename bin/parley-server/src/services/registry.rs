//! Model registry: read-through, TTL-cached view of the model catalog.
//!
//! The whole ordered catalog is cached as one JSON payload under
//! [`MODELS_CACHE_KEY`].  Every catalog write deletes that key so the next
//! read repopulates it.  Cache faults are logged and degrade to a direct
//! catalog read; they never fail a lookup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::entities::{ModelDescriptor, ModelStore, SqliteStore};
use crate::services::cache::CacheBackend;

pub const MODELS_CACHE_KEY: &str = "models:all";

pub struct ModelRegistry {
    store: Arc<SqliteStore>,
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ModelRegistry {
    pub fn new(store: Arc<SqliteStore>, cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    /// The catalog in registration order.
    pub async fn get_models(&self) -> Result<Vec<ModelDescriptor>, sqlx::Error> {
        match self.cache.get(MODELS_CACHE_KEY).await {
            Ok(Some(payload)) => match serde_json::from_str::<Vec<ModelDescriptor>>(&payload) {
                Ok(models) => {
                    debug!(count = models.len(), "model list served from cache");
                    return Ok(models);
                }
                Err(e) => warn!(error = %e, "cached model list is unreadable; reloading"),
            },
            Ok(None) => debug!("model list cache miss"),
            Err(e) => warn!(error = %e, "model cache read failed; reading catalog"),
        }

        let models = self.store.list_models().await?;
        match serde_json::to_string(&models) {
            Ok(payload) => {
                if let Err(e) = self.cache.set(MODELS_CACHE_KEY, payload, self.ttl).await {
                    warn!(error = %e, "failed to populate model cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode model list for cache"),
        }
        Ok(models)
    }

    /// Look a model up by name.  A name the cached list does not know is
    /// checked against the catalog before it is reported missing.
    pub async fn resolve(&self, model_name: &str) -> Result<Option<ModelDescriptor>, sqlx::Error> {
        let cached = self.get_models().await?;
        if let Some(found) = cached.into_iter().find(|m| m.model_name == model_name) {
            return Ok(Some(found));
        }
        Ok(self
            .store
            .list_models()
            .await?
            .into_iter()
            .find(|m| m.model_name == model_name))
    }

    pub async fn register_model(&self, model: ModelDescriptor) -> Result<(), sqlx::Error> {
        self.store.insert_model(model).await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn delete_model(&self, model_name: &str) -> Result<bool, sqlx::Error> {
        let deleted = self.store.delete_model(model_name).await?;
        if deleted {
            self.invalidate().await;
        }
        Ok(deleted)
    }

    /// Count one use of `model_name`.  Returns `false` for an unknown model.
    pub async fn record_usage(&self, model_name: &str) -> Result<bool, sqlx::Error> {
        let found = self.store.record_model_usage(model_name, Utc::now()).await?;
        if found {
            self.invalidate().await;
        }
        Ok(found)
    }

    pub async fn invalidate(&self) {
        if let Err(e) = self.cache.delete(MODELS_CACHE_KEY).await {
            warn!(error = %e, "failed to invalidate model cache");
        }
    }
}
