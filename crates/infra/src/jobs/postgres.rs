//! Postgres-backed job store.
//!
//! The conditional patch is a single `UPDATE ... WHERE <precondition>
//! RETURNING ...`: Postgres row locking serializes concurrent updates of the
//! same job, so two runners racing for one record cannot both see their
//! precondition hold.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) / `Storage` |
//! | Database (check violation) | `23514` | `Corrupt` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / RowNotFound / other | N/A | `Storage` |
//!
//! Attempt counters above `i32::MAX` are refused before binding (`Corrupt`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use portal_core::{JobId, OwnerId};

use super::store::{JobStats, JobStore, JobStoreError, PatchOutcome};
use super::types::{ErrorUpdate, Job, JobPatch, Precondition};

/// Schema for the `jobs` table (idempotent).
pub const SCHEMA: &str = include_str!("../../migrations/0001_create_jobs.sql");

const JOB_COLUMNS: &str = r#"
    id,
    job_type,
    status,
    payload,
    owner_id,
    attempts,
    max_attempts,
    next_run_at,
    locked_by,
    locked_at,
    last_attempt_at,
    last_error,
    created_at,
    updated_at
"#;

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `jobs` table and its indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_many(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let id = job.id;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id,
                job_type,
                status,
                payload,
                owner_id,
                attempts,
                max_attempts,
                next_run_at,
                locked_by,
                locked_at,
                last_attempt_at,
                last_error,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(job.owner_id.map(uuid::Uuid::from))
        .bind(to_db_count(job.attempts, "attempts")?)
        .bind(to_db_count(job.max_attempts, "max_attempts")?)
        .bind(job.next_run_at)
        .bind(&job.locked_by)
        .bind(job.locked_at)
        .bind(job.last_attempt_at)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_count = tracing::field::Empty), err)]
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'pending' AND next_run_at <= $1
            ORDER BY next_run_at ASC, id ASC
            LIMIT $2
            "#
        );
        let jobs = self
            .fetch_many("due_jobs", sqlx::query(&sql).bind(now).bind(limit as i64))
            .await?;

        Span::current().record("job_count", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(owner_id = %owner_id), err)]
    async fn by_owner(
        &self,
        owner_id: OwnerId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE owner_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        self.fetch_many(
            "jobs_by_owner",
            sqlx::query(&sql).bind(owner_id.as_uuid()).bind(limit as i64),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn stale_running(
        &self,
        locked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'running' AND locked_at < $1
            ORDER BY locked_at ASC, id ASC
            LIMIT $2
            "#
        );
        self.fetch_many(
            "stale_running_jobs",
            sqlx::query(&sql).bind(locked_before).bind(limit as i64),
        )
        .await
    }

    #[instrument(
        skip(self, expected, patch),
        fields(
            job_id = %job_id,
            expected_status = %expected.status,
            next_status = %patch.status,
            applied = tracing::field::Empty,
        ),
        err
    )]
    async fn patch_if(
        &self,
        job_id: JobId,
        expected: &Precondition,
        patch: JobPatch,
    ) -> Result<PatchOutcome, JobStoreError> {
        let (write_error, last_error) = match patch.last_error {
            ErrorUpdate::Keep => (false, None),
            ErrorUpdate::Set(msg) => (true, Some(msg)),
            ErrorUpdate::Clear => (true, None),
        };

        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $2,
                locked_by = $3,
                locked_at = $4,
                updated_at = $5,
                attempts = COALESCE($6, attempts),
                next_run_at = COALESCE($7, next_run_at),
                last_attempt_at = COALESCE($8, last_attempt_at),
                last_error = CASE WHEN $9 THEN $10 ELSE last_error END
            WHERE id = $1
                AND status = $11
                AND ($12::timestamptz IS NULL OR next_run_at <= $12)
                AND ($13::text IS NULL OR locked_by = $13)
                AND ($14::timestamptz IS NULL OR locked_at = $14)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let attempts = patch
            .attempts
            .map(|a| to_db_count(a, "attempts"))
            .transpose()?;

        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(patch.status.as_str())
            .bind(&patch.locked_by)
            .bind(patch.locked_at)
            .bind(patch.updated_at)
            .bind(attempts)
            .bind(patch.next_run_at)
            .bind(patch.last_attempt_at)
            .bind(write_error)
            .bind(last_error)
            .bind(expected.status.as_str())
            .bind(expected.due_by)
            .bind(&expected.locked_by)
            .bind(expected.locked_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("patch_job", e))?;

        if let Some(row) = row {
            Span::current().record("applied", true);
            return Ok(PatchOutcome::Applied(job_from_row(&row)?));
        }

        Span::current().record("applied", false);
        match self.get(job_id).await? {
            Some(current) => Ok(PatchOutcome::Rejected(current)),
            None => Ok(PatchOutcome::Missing),
        }
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read count: {e}")))?;
            let status = status.parse().map_err(JobStoreError::Corrupt)?;
            stats.record(status, total.max(0) as usize);
        }
        Ok(stats)
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Corrupt(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation: the write would break a record invariant.
                Some("23514") => JobStoreError::Corrupt(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
/// Attempt counters are INTEGER columns.
fn to_db_count(value: u32, field: &str) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    status: String,
    payload: serde_json::Value,
    owner_id: Option<uuid::Uuid>,
    attempts: i32,
    max_attempts: i32,
    next_run_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            owner_id: row.try_get("owner_id")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            status: row.status.parse().map_err(JobStoreError::Corrupt)?,
            payload: row.payload,
            owner_id: row.owner_id.map(OwnerId::from_uuid),
            attempts: u32::try_from(row.attempts)
                .map_err(|_| JobStoreError::Corrupt(format!("negative attempts on {}", row.id)))?,
            max_attempts: u32::try_from(row.max_attempts).map_err(|_| {
                JobStoreError::Corrupt(format!("negative max_attempts on {}", row.id))
            })?,
            next_run_at: row.next_run_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            last_attempt_at: row.last_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
