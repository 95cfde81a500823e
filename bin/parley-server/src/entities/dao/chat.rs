use chrono::{DateTime, Utc};

/// A row in the `chats` table.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    /// Name of the model the chat is bound to.
    pub model_name: String,
    pub title: String,
    /// Number of persisted messages; bumped in the same transaction as each append.
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
