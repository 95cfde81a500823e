use chrono::{DateTime, Utc};

/// A row in the `users` table.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    /// bcrypt hash in modular crypt format (`$2b$...`).
    pub password_digest: String,
    pub default_model: Option<String>,
    pub theme: Option<String>,
    pub created_at: DateTime<Utc>,
}
