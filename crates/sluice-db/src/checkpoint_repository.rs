use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sluice_core::error::AppError;
use sluice_core::models::CheckpointSummary;
use sluice_core::traits::CheckpointBackend;
use sqlx::{PgPool, Pool, Postgres};

/// Checkpoint sets stored in PostgreSQL, one row per processed unit.
#[derive(Clone)]
pub struct CheckpointRepository {
    pool: Pool<Postgres>,
}

impl CheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointBackend for CheckpointRepository {
    async fn load(&self, pipeline: &str, resource: &str) -> Result<HashSet<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT unit_id
            FROM checkpoints
            WHERE pipeline = $1 AND resource = $2
            "#,
        )
        .bind(pipeline)
        .bind(resource)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Insert all ids in one statement; existing rows are left untouched.
    async fn save(&self, pipeline: &str, resource: &str, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (pipeline, resource, unit_id)
            SELECT $1, $2, unit_id FROM UNNEST($3::text[]) AS t(unit_id)
            ON CONFLICT (pipeline, resource, unit_id) DO NOTHING
            "#,
        )
        .bind(pipeline)
        .bind(resource)
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            %pipeline,
            %resource,
            submitted = ids.len(),
            inserted = result.rows_affected(),
            "Checkpoints saved"
        );
        Ok(())
    }

    async fn reset(&self, pipeline: &str, resource: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM checkpoints
            WHERE pipeline = $1 AND resource = $2
            "#,
        )
        .bind(pipeline)
        .bind(resource)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn scopes(&self, pipeline: &str) -> Result<Vec<CheckpointSummary>, AppError> {
        let rows = sqlx::query_as::<_, ScopeRow>(
            r#"
            SELECT resource, COUNT(*) AS entries, MAX(created_at) AS last_updated
            FROM checkpoints
            WHERE pipeline = $1
            GROUP BY resource
            ORDER BY resource
            "#,
        )
        .bind(pipeline)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| CheckpointSummary {
                pipeline: pipeline.to_string(),
                resource: row.resource,
                entries: u64::try_from(row.entries).unwrap_or(0),
                last_updated: row.last_updated,
            })
            .collect())
    }
}

/// Internal row type for the per-scope aggregate.
#[derive(sqlx::FromRow)]
struct ScopeRow {
    resource: String,
    entries: i64,
    last_updated: Option<DateTime<Utc>>,
}
