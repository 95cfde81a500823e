use crate::entities::{
    SqliteStore, dao::ModelDescriptor, format_ts, parse_optional_rfc3339, parse_rfc3339_or_now,
};
use chrono::{DateTime, Utc};
use std::future::Future;

pub trait ModelStore: Send + Sync + 'static {
    /// Insert a catalog entry; a duplicate `model_name` is a unique violation.
    fn insert_model(
        &self,
        record: ModelDescriptor,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
    /// Insert the entries whose names are not taken yet.  Returns how many landed.
    fn seed_models(
        &self,
        records: &[ModelDescriptor],
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
    fn list_models(&self) -> impl Future<Output = Result<Vec<ModelDescriptor>, sqlx::Error>> + Send;
    fn delete_model(&self, model_name: &str) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
    /// Bump `usage_count` and stamp `last_used_at`.  Returns `false` for an unknown model.
    fn record_model_usage(
        &self,
        model_name: &str,
        used_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, sqlx::Error>> + Send;
}

type ModelRow = (String, String, String, i64, Option<String>, String);

impl ModelStore for SqliteStore {
    async fn insert_model(&self, record: ModelDescriptor) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO models (model_name, label, description, usage_count, last_used_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&record.model_name)
        .bind(&record.label)
        .bind(&record.description)
        .bind(record.usage_count)
        .bind(record.last_used_at.as_ref().map(format_ts))
        .bind(format_ts(&record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn seed_models(&self, records: &[ModelDescriptor]) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for record in records {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO models (model_name, label, description, usage_count, last_used_at, created_at) \
                 VALUES (?1, ?2, ?3, 0, NULL, ?4)",
            )
            .bind(&record.model_name)
            .bind(&record.label)
            .bind(&record.description)
            .bind(format_ts(&record.created_at))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, sqlx::Error> {
        let rows: Vec<ModelRow> = sqlx::query_as(
            "SELECT model_name, label, description, usage_count, last_used_at, created_at \
             FROM models ORDER BY created_at ASC, model_name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(model_name, label, description, usage_count, last_used_at, created_at)| {
                    ModelDescriptor {
                        model_name,
                        label,
                        description,
                        usage_count,
                        last_used_at: parse_optional_rfc3339(last_used_at, "model.last_used_at"),
                        created_at: parse_rfc3339_or_now(&created_at, "model.created_at"),
                    }
                },
            )
            .collect())
    }

    async fn delete_model(&self, model_name: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM models WHERE model_name = ?1")
            .bind(model_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_model_usage(
        &self,
        model_name: &str,
        used_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE models SET usage_count = usage_count + 1, last_used_at = ?1 WHERE model_name = ?2",
        )
        .bind(format_ts(&used_at))
        .bind(model_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
