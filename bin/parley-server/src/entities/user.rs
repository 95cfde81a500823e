use crate::entities::{SqliteStore, dao::UserRecord, format_ts, parse_rfc3339_or_now};
use std::future::Future;

pub trait UserStore: Send + Sync + 'static {
    /// Insert a user; a taken username or email is a unique violation.
    fn insert_user(&self, user: UserRecord) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
    fn get_user(&self, id: &str) -> impl Future<Output = Result<Option<UserRecord>, sqlx::Error>> + Send;
    fn find_user_by_username(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Option<UserRecord>, sqlx::Error>> + Send;
}

type UserRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
);

const USER_COLUMNS: &str = "id, username, email, password_digest, default_model, theme, created_at";

fn user_from_row(
    (id, username, email, password_digest, default_model, theme, created_at): UserRow,
) -> UserRecord {
    UserRecord {
        id,
        username,
        email,
        password_digest,
        default_model,
        theme,
        created_at: parse_rfc3339_or_now(&created_at, "user.created_at"),
    }
}

impl UserStore for SqliteStore {
    async fn insert_user(&self, user: UserRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_digest, default_model, theme, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_digest)
        .bind(&user.default_model)
        .bind(&user.theme)
        .bind(format_ts(&user.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(user_from_row))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"))
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(user_from_row))
    }
}
