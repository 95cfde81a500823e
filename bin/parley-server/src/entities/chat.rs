use crate::entities::{SqliteStore, dao::Chat, format_ts, parse_rfc3339_or_now};
use std::future::Future;

pub trait ChatStore: Send + Sync + 'static {
    fn create_chat(&self, chat: Chat) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
    fn get_chat(&self, id: &str) -> impl Future<Output = Result<Option<Chat>, sqlx::Error>> + Send;
    /// Chats owned by `user_id`, most recently updated first.
    fn list_chats(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Chat>, sqlx::Error>> + Send;
    /// Delete a chat and all of its messages.  Returns `false` if it did not exist.
    fn delete_chat(&self, id: &str) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

type ChatRow = (String, String, String, String, i64, String, String);

fn chat_from_row(
    (id, user_id, model_name, title, message_count, created_at, updated_at): ChatRow,
) -> Chat {
    Chat {
        id,
        user_id,
        model_name,
        title,
        message_count,
        created_at: parse_rfc3339_or_now(&created_at, "chat.created_at"),
        updated_at: parse_rfc3339_or_now(&updated_at, "chat.updated_at"),
    }
}

impl ChatStore for SqliteStore {
    async fn create_chat(&self, chat: Chat) -> Result<(), sqlx::Error> {
        let created_at = format_ts(&chat.created_at);
        let updated_at = format_ts(&chat.updated_at);
        sqlx::query(
            "INSERT INTO chats (id, user_id, model_name, title, message_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&chat.id)
        .bind(&chat.user_id)
        .bind(&chat.model_name)
        .bind(&chat.title)
        .bind(chat.message_count)
        .bind(&created_at)
        .bind(&updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, sqlx::Error> {
        let row: Option<ChatRow> = sqlx::query_as(
            "SELECT id, user_id, model_name, title, message_count, created_at, updated_at \
             FROM chats WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(chat_from_row))
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>, sqlx::Error> {
        let rows: Vec<ChatRow> = sqlx::query_as(
            "SELECT id, user_id, model_name, title, message_count, created_at, updated_at \
             FROM chats WHERE user_id = ?1 ORDER BY updated_at DESC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(chat_from_row).collect())
    }

    async fn delete_chat(&self, id: &str) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE chat_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM chats WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
