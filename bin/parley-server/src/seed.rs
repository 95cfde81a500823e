//! Default model catalog and password hashing helpers.

use tracing::{info, warn};

use crate::entities::{ModelDescriptor, ModelStore, SqliteStore};

/// Catalog installed on first start.
pub fn default_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::new("granite3.3:latest", "Granite 3.3", "Great for summarizing stuff."),
        ModelDescriptor::new("llama3.1:latest", "Llama 3.1", "General purpose language model."),
        ModelDescriptor::new("mistral:latest", "Mistral", "Good for programming tasks."),
    ]
}

/// Install [`default_catalog`] when the catalog is empty.  Returns how many
/// models were inserted.
pub async fn seed_models_if_empty(store: &SqliteStore) -> Result<u64, sqlx::Error> {
    if !store.list_models().await?.is_empty() {
        return Ok(0);
    }
    let inserted = store.seed_models(&default_catalog()).await?;
    info!(inserted, "seeded default model catalog");
    Ok(inserted)
}

/// Work factor for new hashes.  Tests use the minimum to stay fast.
const HASH_COST: u32 = if cfg!(test) { 4 } else { bcrypt::DEFAULT_COST };

/// bcrypt hash of `password` in modular crypt format.  CPU bound; call it
/// from a blocking task.
pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, HASH_COST)
}

/// Check `password` against a stored bcrypt hash.  A malformed hash never
/// matches.
pub fn verify_password(password: &str, digest: &str) -> bool {
    match bcrypt::verify(password, digest) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(error = %e, "stored password hash is unreadable");
            false
        }
    }
}
