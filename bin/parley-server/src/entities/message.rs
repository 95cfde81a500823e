use crate::entities::{
    SqliteStore,
    dao::{ChatMessage, Role},
    format_ts, parse_rfc3339_or_now,
};
use chrono::Utc;
use std::future::Future;
use std::str::FromStr;
use uuid::Uuid;

pub trait MessageStore: Send + Sync + 'static {
    /// Append a message to `chat_id` and bump the chat's `updated_at` and
    /// `message_count` in the same transaction.
    ///
    /// Fails with [`sqlx::Error::RowNotFound`] if the chat does not exist.
    fn append_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> impl Future<Output = Result<ChatMessage, sqlx::Error>> + Send;

    /// All messages of `chat_id` in creation order.
    fn list_messages(
        &self,
        chat_id: &str,
    ) -> impl Future<Output = Result<Vec<ChatMessage>, sqlx::Error>> + Send;
}

impl MessageStore for SqliteStore {
    async fn append_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<ChatMessage, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let created_at = format_ts(&now);

        let mut tx = self.pool.begin().await?;
        let touched = sqlx::query(
            "UPDATE chats SET message_count = message_count + 1, updated_at = ?1 WHERE id = ?2",
        )
        .bind(&created_at)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            // Dropping `tx` rolls back.
            return Err(sqlx::Error::RowNotFound);
        }

        let inserted = sqlx::query(
            "INSERT INTO messages (id, chat_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(chat_id)
        .bind(role.as_ref())
        .bind(content)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(ChatMessage {
            id,
            chat_id: chat_id.to_owned(),
            seq: inserted.last_insert_rowid(),
            role,
            content: content.to_owned(),
            created_at: now,
        })
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, sqlx::Error> {
        let rows: Vec<(String, String, i64, String, String, String)> = sqlx::query_as(
            "SELECT id, chat_id, seq, role, content, created_at \
             FROM messages WHERE chat_id = ?1 ORDER BY seq ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, chat_id, seq, role, content, created_at)| -> Result<ChatMessage, sqlx::Error> {
                let role = Role::from_str(&role).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
                Ok(ChatMessage {
                    id,
                    chat_id,
                    seq,
                    role,
                    content,
                    created_at: parse_rfc3339_or_now(&created_at, "message.created_at"),
                })
            })
            .collect()
    }
}
