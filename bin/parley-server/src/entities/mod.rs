//! Persistence gateway.
//!
//! Each concern gets its own store trait ([`ChatStore`], [`MessageStore`],
//! [`ModelStore`], [`UserStore`]) implemented for [`SqliteStore`].  Handlers
//! and services only see the traits, so swapping the database means
//! implementing them for a new type and changing the concrete type in
//! [`crate::state::AppState`].
//!
//! All trait methods use `impl Future` in their signatures so no extra
//! `async-trait` crate is required at this seam.

pub mod chat;
pub mod dao;
pub mod message;
pub mod model;
pub mod user;

pub use dao::{Chat, ChatMessage, ModelDescriptor, Role, UserRecord};

pub use chat::ChatStore;
pub use message::MessageStore;
pub use model::ModelStore;
pub use user::UserStore;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

/// SQLite-backed primary store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending migrations.
    ///
    /// `url` should be a sqlx-compatible SQLite URL, e.g. `"sqlite://parley.db"`
    /// or `"sqlite::memory:"` for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = open_pool(url).await?;
        // Path is resolved relative to CARGO_MANIFEST_DIR at compile time.
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Close every pooled connection.  Calls made afterwards fail with
    /// [`sqlx::Error::PoolClosed`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Build a pool for `url`.
///
/// An in-memory database lives and dies with its connection, so memory URLs
/// get exactly one connection that is never recycled.
pub(crate) async fn open_pool(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool_options = if is_memory_url(url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };

    pool_options.connect_with(options).await
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Fixed-width RFC 3339 (microseconds, `Z`), so stored timestamps also sort
/// correctly as text.
pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_rfc3339_or_now(raw: &str, field: &'static str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|e: chrono::ParseError| {
        tracing::warn!(raw = %raw, error = %e, field, "failed to parse timestamp; using now");
        Utc::now()
    })
}

pub(crate) fn parse_optional_rfc3339(
    raw: Option<String>,
    field: &'static str,
) -> Option<DateTime<Utc>> {
    raw.and_then(|v| {
        v.parse()
            .map_err(|e: chrono::ParseError| {
                tracing::warn!(raw = %v, error = %e, field, "failed to parse optional timestamp; dropping value");
                e
            })
            .ok()
    })
}

/// `true` when `err` is a UNIQUE / PRIMARY KEY constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
