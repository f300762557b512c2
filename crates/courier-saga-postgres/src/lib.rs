//! PostgreSQL implementation of the Courier saga repository.
//!
//! Saga data is stored as JSONB next to the state-machine columns, so any
//! [`SagaData`] that round-trips through serde can be persisted.
//!
//! # Features
//!
//! - Optimistic concurrency on a `version` column
//! - Several saga definitions sharing one table, keyed by saga name
//! - Aggregate counts computed in the database
//! - Cleanup of finished instances
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE sagas (
//!     saga_name TEXT NOT NULL,
//!     id TEXT NOT NULL,
//!     current_state TEXT NOT NULL,
//!     cancelled BOOLEAN NOT NULL DEFAULT FALSE,
//!     completed BOOLEAN NOT NULL DEFAULT FALSE,
//!     version BIGINT NOT NULL,
//!     data JSONB NOT NULL,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     PRIMARY KEY (saga_name, id)
//! );
//!
//! CREATE INDEX idx_sagas_finished ON sagas (saga_name, updated_at)
//!     WHERE completed OR cancelled;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier_saga_postgres::PgSagaRepository;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let repository = Arc::new(PgSagaRepository::<OrderData>::new(pool, "order"));
//! repository.ensure_schema().await?;
//!
//! let engine = SagaEngine::builder(definition, repository).build();
//! ```

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_saga::{SagaCounts, SagaData, SagaInstance, SagaRepository, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sagas (
    saga_name TEXT NOT NULL,
    id TEXT NOT NULL,
    current_state TEXT NOT NULL,
    cancelled BOOLEAN NOT NULL DEFAULT FALSE,
    completed BOOLEAN NOT NULL DEFAULT FALSE,
    version BIGINT NOT NULL,
    data JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (saga_name, id)
);
CREATE INDEX IF NOT EXISTS idx_sagas_finished ON sagas (saga_name, updated_at)
    WHERE completed OR cancelled;
"#;

/// PostgreSQL saga repository for one saga definition.
pub struct PgSagaRepository<D> {
    pool: PgPool,
    saga_name: String,
    _data: PhantomData<fn() -> D>,
}

impl<D> Clone for PgSagaRepository<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            saga_name: self.saga_name.clone(),
            _data: PhantomData,
        }
    }
}

impl<D> std::fmt::Debug for PgSagaRepository<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSagaRepository")
            .field("saga_name", &self.saga_name)
            .finish_non_exhaustive()
    }
}

impl<D> PgSagaRepository<D> {
    /// Create a repository for the saga named `saga_name`.
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    /// * `saga_name` - Partition key; use the definition's name
    pub fn new(pool: PgPool, saga_name: impl Into<String>) -> Self {
        Self {
            pool,
            saga_name: saga_name.into(),
            _data: PhantomData,
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    /// Create the `sagas` table and its index if they do not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Delete completed or cancelled instances last saved before `older_than`.
    pub async fn cleanup_finished(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sagas
            WHERE saga_name = $1
              AND (completed OR cancelled)
              AND updated_at < $2
            "#,
        )
        .bind(&self.saga_name)
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        debug!(
            saga = %self.saga_name,
            deleted = result.rows_affected(),
            "cleaned up finished sagas"
        );
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl<D> SagaRepository<D> for PgSagaRepository<D>
where
    D: SagaData + Serialize + DeserializeOwned,
{
    async fn find_by_id(&self, id: &str) -> Result<Option<SagaInstance<D>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, current_state, cancelled, completed, version, data, created_at, updated_at
            FROM sagas
            WHERE saga_name = $1 AND id = $2
            "#,
        )
        .bind(&self.saga_name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| decode(&row)).transpose()
    }

    async fn find_all(&self) -> Result<Vec<SagaInstance<D>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, current_state, cancelled, completed, version, data, created_at, updated_at
            FROM sagas
            WHERE saga_name = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(&self.saga_name)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(decode).collect()
    }

    /// Insert on first save, otherwise update guarded by the loaded version.
    ///
    /// Zero affected rows means another writer got there first.
    async fn save_and_flush(&self, instance: &SagaInstance<D>) -> Result<u64, StoreError> {
        let data = serde_json::to_value(&instance.data).map_err(|e| StoreError::Backend(e.into()))?;
        let expected = to_db_version(instance.version)?;
        let next = to_db_version(instance.version + 1)?;

        let outcome = if instance.is_new() {
            sqlx::query(
                r#"
                INSERT INTO sagas
                    (saga_name, id, current_state, cancelled, completed, version, data, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (saga_name, id) DO NOTHING
                "#,
            )
            .bind(&self.saga_name)
            .bind(&instance.id)
            .bind(&instance.current_state)
            .bind(instance.cancelled)
            .bind(instance.completed)
            .bind(next)
            .bind(&data)
            .bind(instance.created_at)
            .bind(instance.updated_at)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE sagas
                SET current_state = $3,
                    cancelled = $4,
                    completed = $5,
                    version = $6,
                    data = $7,
                    updated_at = $8
                WHERE saga_name = $1
                  AND id = $2
                  AND version = $9
                "#,
            )
            .bind(&self.saga_name)
            .bind(&instance.id)
            .bind(&instance.current_state)
            .bind(instance.cancelled)
            .bind(instance.completed)
            .bind(next)
            .bind(&data)
            .bind(instance.updated_at)
            .bind(expected)
            .execute(&self.pool)
            .await
        };
        let result = outcome.map_err(backend)?;

        if result.rows_affected() == 0 {
            debug!(saga = %self.saga_name, saga_id = %instance.id, "version conflict on save");
            return Err(StoreError::Conflict);
        }
        Ok(instance.version + 1)
    }

    async fn counts(&self) -> Result<SagaCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE NOT cancelled AND NOT completed) as active,
                COUNT(*) FILTER (WHERE completed AND NOT cancelled) as completed,
                COUNT(*) FILTER (WHERE cancelled) as cancelled
            FROM sagas
            WHERE saga_name = $1
            "#,
        )
        .bind(&self.saga_name)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row.try_get(column).map_err(backend)?;
            u64::try_from(value).map_err(|e| StoreError::Backend(e.into()))
        };

        Ok(SagaCounts {
            active: count("active")?,
            completed: count("completed")?,
            cancelled: count("cancelled")?,
        })
    }
}

fn decode<D: DeserializeOwned>(row: &PgRow) -> Result<SagaInstance<D>, StoreError> {
    let version: i64 = row.try_get("version").map_err(backend)?;
    let data: serde_json::Value = row.try_get("data").map_err(backend)?;

    Ok(SagaInstance {
        id: row.try_get("id").map_err(backend)?,
        current_state: row.try_get("current_state").map_err(backend)?,
        cancelled: row.try_get("cancelled").map_err(backend)?,
        completed: row.try_get("completed").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
        version: u64::try_from(version).map_err(|e| StoreError::Backend(e.into()))?,
        data: serde_json::from_value(data).map_err(|e| StoreError::Backend(e.into()))?,
    })
}

fn to_db_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Backend(anyhow::anyhow!("saga version {version} out of range")))
}

fn backend(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conversion() {
        assert_eq!(to_db_version(0).unwrap(), 0);
        assert_eq!(to_db_version(41).unwrap(), 41);
        assert!(matches!(
            to_db_version(u64::MAX),
            Err(StoreError::Backend(_))
        ));
    }

    #[test]
    fn test_schema_is_idempotent() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS sagas"));
        assert!(SCHEMA.contains("CREATE INDEX IF NOT EXISTS"));
        assert!(SCHEMA.contains("PRIMARY KEY (saga_name, id)"));
    }
}
