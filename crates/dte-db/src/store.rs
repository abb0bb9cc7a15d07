//! Postgres-backed [`ResultStore`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use dte_core::error::AppError;
use dte_core::job::{Attempt, AttemptOutcome, Job, JobRecord, JobStatus, Priority};
use dte_core::traits::ResultStore;

/// Jobs in `jobs`, their attempts in `job_attempts`.
///
/// Every mutator carries a `status NOT IN ('succeeded', 'dead_lettered')`
/// guard, so terminal jobs are never rewritten.
#[derive(Clone)]
pub struct PgResultStore {
    pool: Pool<Postgres>,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Turn an update's row count into the `ResultStore` answer: `true` if
    /// applied, `false` if the job exists but is terminal.
    async fn applied(&self, job_id: Uuid, rows_affected: u64) -> Result<bool, AppError> {
        if rows_affected > 0 {
            return Ok(true);
        }
        let (exists,): (bool,) = sqlx::query_as(r#"SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)"#)
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        if exists {
            tracing::debug!(%job_id, "Ignoring update to terminal job");
            Ok(false)
        } else {
            Err(AppError::NotFound(job_id))
        }
    }

    async fn attempts(&self, job_id: Uuid) -> Result<Vec<Attempt>, AppError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM job_attempts
            WHERE job_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(Attempt::try_from).collect()
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    target: serde_json::Value,
    payload: serde_json::Value,
    priority: i16,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    attempt_count: i32,
    max_retries: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_backoff_ms: i64,
    error_detail: Option<String>,
    result: Option<serde_json::Value>,
    worker_id: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            target: serde_json::from_value(row.target)?,
            payload: row.payload,
            priority: Priority::from_i16(row.priority),
            status: row.status.parse().map_err(AppError::InfrastructureError)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            attempt_count: row.attempt_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            next_attempt_at: row.next_attempt_at,
            last_backoff_ms: row.last_backoff_ms.max(0) as u64,
            error_detail: row.error_detail,
            result: row.result,
            worker_id: row.worker_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    job_id: Uuid,
    attempt_number: i32,
    assigned_proxy: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    outcome: String,
    error_detail: Option<String>,
}

impl TryFrom<AttemptRow> for Attempt {
    type Error = AppError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(Attempt {
            job_id: row.job_id,
            attempt_number: row.attempt_number.max(0) as u32,
            assigned_proxy: row.assigned_proxy,
            started_at: row.started_at,
            ended_at: row.ended_at,
            outcome: row.outcome.parse().map_err(AppError::InfrastructureError)?,
            error_detail: row.error_detail,
        })
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::InfrastructureError(e.to_string())
}

impl ResultStore for PgResultStore {
    async fn insert(&self, job: &Job) -> Result<(), AppError> {
        let target = serde_json::to_value(&job.target)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, target, payload, priority, status, created_at, updated_at,
                              attempt_count, max_retries, last_backoff_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(target)
        .bind(&job.payload)
        .bind(job.priority.as_i16())
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.attempt_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.last_backoff_ms.min(i64::MAX as u64) as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::ValidationError(format!("Job {} already exists", job.id))
            }
            _ => db_error(e),
        })?;

        Ok(())
    }

    async fn get_status(&self, job_id: Uuid) -> Result<JobRecord, AppError> {
        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or(AppError::NotFound(job_id))?;

        Ok(JobRecord {
            job: row.try_into()?,
            attempts: self.attempts(job_id).await?,
        })
    }

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('succeeded', 'dead_lettered')
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        self.applied(job_id, result.rows_affected()).await
    }

    async fn begin_attempt(&self, job_id: Uuid, worker_id: &str) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET attempt_count = attempt_count + 1, status = 'running', worker_id = $2,
                next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1
              AND status NOT IN ('succeeded', 'dead_lettered')
              AND attempt_count < max_retries + 1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => self.applied(job_id, 0).await.map(|_| None),
        }
    }

    async fn record_outcome(
        &self,
        job_id: Uuid,
        attempt: &Attempt,
        result: Option<serde_json::Value>,
    ) -> Result<JobRecord, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let status: Option<(String,)> =
            sqlx::query_as(r#"SELECT status FROM jobs WHERE id = $1 FOR UPDATE"#)
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;

        let status: JobStatus = status
            .ok_or(AppError::NotFound(job_id))?
            .0
            .parse()
            .map_err(AppError::InfrastructureError)?;

        if status.is_terminal() {
            tx.rollback().await.map_err(db_error)?;
            tracing::debug!(%job_id, "Outcome for terminal job dropped");
            return self.get_status(job_id).await;
        }

        sqlx::query(
            r#"
            INSERT INTO job_attempts (job_id, attempt_number, assigned_proxy, started_at,
                                      ended_at, outcome, error_detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id, attempt_number) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(attempt.attempt_number as i32)
        .bind(&attempt.assigned_proxy)
        .bind(attempt.started_at)
        .bind(attempt.ended_at)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.error_detail)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if attempt.outcome == AttemptOutcome::Succeeded {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'succeeded', result = $2, error_detail = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(result)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed', error_detail = $2, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(&attempt.error_detail)
            .execute(&mut *tx)
            .await
        }
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        self.get_status(job_id).await
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        not_before: DateTime<Utc>,
        backoff: Duration,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'retrying', next_attempt_at = $2, last_backoff_ms = $3, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('succeeded', 'dead_lettered')
            "#,
        )
        .bind(job_id)
        .bind(not_before)
        .bind(backoff.as_millis().min(i64::MAX as u128) as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        self.applied(job_id, result.rows_affected()).await
    }

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead_lettered', error_detail = $2, next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('succeeded', 'dead_lettered')
            "#,
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        self.applied(job_id, result.rows_affected()).await
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as(r#"SELECT status, COUNT(*) FROM jobs GROUP BY status"#)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(JobStatus::ALL
            .iter()
            .map(|status| {
                let n = rows
                    .iter()
                    .find(|(s, _)| s == status.as_str())
                    .map(|(_, n)| (*n).max(0) as u64)
                    .unwrap_or(0);
                (*status, n)
            })
            .collect())
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(db_error)?;

        rows.into_iter().map(Job::try_from).collect()
    }
}
