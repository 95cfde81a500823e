//! Full-text index over persisted messages.
//!
//! The index is a derived, eventually consistent view.  It lives in its own
//! SQLite database (an FTS5 table) so that a broken or locked index file can
//! never stall the primary store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::entities::{ChatMessage, Role, format_ts, open_pool};

/// One indexed message.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDocument {
    pub message_id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&ChatMessage> for SearchDocument {
    fn from(m: &ChatMessage) -> Self {
        Self {
            message_id: m.id.clone(),
            chat_id: m.chat_id.clone(),
            role: m.role,
            content: m.content.clone(),
            created_at: m.created_at,
        }
    }
}

/// A ranked match.  `id` is the message id.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub chat_id: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search index unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("search query has no terms")]
    EmptyQuery,
}

#[async_trait]
pub trait SearchIndex: Send + Sync + 'static {
    /// Add (or replace) one message.  Idempotent per message id.
    async fn index(&self, doc: SearchDocument) -> Result<(), IndexError>;
    /// Best matches first.
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, IndexError>;
    /// Forget every message of `chat_id`.
    async fn remove_chat(&self, chat_id: &str) -> Result<(), IndexError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSearchIndex {
    pool: SqlitePool,
}

impl SqliteSearchIndex {
    pub async fn connect(url: &str) -> Result<Self, IndexError> {
        let pool = open_pool(url).await?;
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(\
                message_id UNINDEXED, \
                chat_id UNINDEXED, \
                role UNINDEXED, \
                content, \
                created_at UNINDEXED\
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Quote every whitespace-separated term so user input is matched literally
/// instead of being parsed as FTS5 syntax.  Terms are ANDed.
fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

#[async_trait]
impl SearchIndex for SqliteSearchIndex {
    async fn index(&self, doc: SearchDocument) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages_fts WHERE message_id = ?1")
            .bind(&doc.message_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO messages_fts (message_id, chat_id, role, content, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&doc.message_id)
        .bind(&doc.chat_id)
        .bind(doc.role.as_ref())
        .bind(&doc.content)
        .bind(format_ts(&doc.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>, IndexError> {
        let Some(expr) = fts_query(query) else {
            return Err(IndexError::EmptyQuery);
        };
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT message_id, chat_id, content FROM messages_fts \
             WHERE messages_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )
        .bind(expr)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, chat_id, content)| SearchHit { id, chat_id, content })
            .collect())
    }

    async fn remove_chat(&self, chat_id: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM messages_fts WHERE chat_id = ?1")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
