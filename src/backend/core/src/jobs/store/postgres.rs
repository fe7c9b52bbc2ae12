//! PostgreSQL job store.
//!
//! Claims lock the oldest claimable row with `FOR UPDATE SKIP LOCKED`, so
//! concurrent workers never block on or double-claim the same job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgExecutor;
use uuid::Uuid;

use super::JobStore;
use crate::config::DatabaseConfig;
use crate::error::{Result, TasklineError};
use crate::jobs::{JobId, JobList, JobListOptions, JobRecord, JobState};

const COLUMNS: &str = "id, queue_name, data, state, progress, result, error, error_kind, attempts, retries, \
     created_at, started_at, settled_at, retry_at, heartbeat_at, worker_id, cancel_requested, version";

/// Job store backed by the `taskline_jobs` table.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    run_migrations: bool,
}

impl PostgresJobStore {
    /// Open a connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            run_migrations: config.run_migrations,
        })
    }

    /// Wrap an existing pool. Migrations still run on `init`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            run_migrations: true,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TasklineError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }
}

/// Write every mutable column if the stored version is still `record.version`.
async fn write_record<'e, E: PgExecutor<'e>>(executor: E, record: &JobRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE taskline_jobs
        SET state = $3,
            progress = $4,
            result = $5,
            error = $6,
            error_kind = $7,
            attempts = $8,
            retries = $9,
            started_at = $10,
            settled_at = $11,
            retry_at = $12,
            heartbeat_at = $13,
            worker_id = $14,
            cancel_requested = $15,
            version = version + 1
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(record.id.0)
    .bind(record.version)
    .bind(record.state.as_str())
    .bind(record.progress as i16)
    .bind(&record.result)
    .bind(&record.error)
    .bind(record.error_kind.map(|k| k.as_str()))
    .bind(record.attempts as i32)
    .bind(record.retries as i32)
    .bind(record.started_at)
    .bind(record.settled_at)
    .bind(record.retry_at)
    .bind(record.heartbeat_at)
    .bind(&record.worker_id)
    .bind(record.cancel_requested)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn init(&self) -> Result<()> {
        if self.run_migrations {
            self.migrate().await?;
        }
        Ok(())
    }

    async fn insert(&self, record: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO taskline_jobs (
                id, queue_name, data, state, progress, result, error, error_kind, attempts, retries,
                created_at, started_at, settled_at, retry_at, heartbeat_at, worker_id, cancel_requested, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(record.id.0)
        .bind(&record.queue_name)
        .bind(&record.data)
        .bind(record.state.as_str())
        .bind(record.progress as i16)
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.error_kind.map(|k| k.as_str()))
        .bind(record.attempts as i32)
        .bind(record.retries as i32)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.settled_at)
        .bind(record.retry_at)
        .bind(record.heartbeat_at)
        .bind(&record.worker_id)
        .bind(record.cancel_requested)
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_next(&self, queue_name: &str, worker_id: &str, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM taskline_jobs
            WHERE queue_name = $1
              AND (state = 'PENDING' OR (state = 'RETRYING' AND (retry_at IS NULL OR retry_at <= $2)))
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(queue_name)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let mut record = row.into_record()?;
        record.start(worker_id, now)?;
        if !write_record(&mut *tx, &record).await? {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;

        record.version += 1;
        Ok(Some(record))
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {COLUMNS} FROM taskline_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRow::into_record).transpose()
    }

    async fn list(&self, options: &JobListOptions) -> Result<JobList> {
        let states: Vec<&str> = options.states.iter().map(|s| s.as_str()).collect();
        let filter = "(cardinality($1::text[]) = 0 OR queue_name = ANY($1)) \
                      AND (cardinality($2::text[]) = 0 OR state = ANY($2))";

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM taskline_jobs WHERE {filter}"))
            .bind(&options.queue_names)
            .bind(&states)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {COLUMNS} FROM taskline_jobs WHERE {filter} ORDER BY created_at, id OFFSET $3 LIMIT $4"
        ))
        .bind(&options.queue_names)
        .bind(&states)
        .bind(options.skip as i64)
        .bind(options.take.map(|t| t as i64))
        .fetch_all(&self.pool)
        .await?;

        let items = rows.into_iter().map(JobRow::into_record).collect::<Result<Vec<_>>>()?;
        Ok(JobList {
            items,
            total: total as usize,
        })
    }

    async fn update(&self, record: &mut JobRecord) -> Result<bool> {
        let written = write_record(&self.pool, record).await?;
        if written {
            record.version += 1;
        }
        Ok(written)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM taskline_jobs
            WHERE state = 'RUNNING' AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            ORDER BY heartbeat_at NULLS FIRST
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_record).collect()
    }

    async fn remove_settled(&self, queue_names: &[String], older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM taskline_jobs
            WHERE state IN ('COMPLETED', 'FAILED', 'CANCELLED')
              AND settled_at < $2
              AND (cardinality($1::text[]) = 0 OR queue_name = ANY($1))
            "#,
        )
        .bind(queue_names)
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    data: serde_json::Value,
    state: String,
    progress: i16,
    result: Option<serde_json::Value>,
    error: Option<String>,
    error_kind: Option<String>,
    attempts: i32,
    retries: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
    retry_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    cancel_requested: bool,
    version: i64,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: JobId(self.id),
            queue_name: self.queue_name,
            data: self.data,
            state: self.state.parse::<JobState>()?,
            progress: self.progress.clamp(0, 100) as u8,
            result: self.result,
            error: self.error,
            error_kind: self.error_kind.as_deref().map(str::parse).transpose()?,
            attempts: self.attempts.max(0) as u32,
            retries: self.retries.max(0) as u32,
            created_at: self.created_at,
            started_at: self.started_at,
            settled_at: self.settled_at,
            retry_at: self.retry_at,
            heartbeat_at: self.heartbeat_at,
            worker_id: self.worker_id,
            cancel_requested: self.cancel_requested,
            version: self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobErrorKind;

    fn row(state: &str, error_kind: Option<&str>) -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            queue_name: "q".into(),
            data: serde_json::json!({"a": 1}),
            state: state.into(),
            progress: 250,
            result: None,
            error: None,
            error_kind: error_kind.map(Into::into),
            attempts: 2,
            retries: 3,
            created_at: Utc::now(),
            started_at: None,
            settled_at: None,
            retry_at: None,
            heartbeat_at: None,
            worker_id: None,
            cancel_requested: false,
            version: 9,
        }
    }

    #[test]
    fn test_row_conversion() {
        let record = row("FAILED", Some("orphaned")).into_record().unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error_kind, Some(JobErrorKind::Orphaned));
        assert_eq!(record.progress, 100);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.version, 9);
    }

    #[test]
    fn test_row_with_unknown_state_is_rejected() {
        assert!(row("PAUSED", None).into_record().is_err());
    }
}
