//! Postgres-backed [`JobQueue`].
//!
//! Entries live in `job_queue`. Workers claim them with
//! `SELECT ... FOR UPDATE SKIP LOCKED`, so concurrent workers on any number
//! of hosts never lease the same row twice. A lease is a `leased_by` value
//! plus a `lease_expires_at` deadline; expired leases are claimable again.
//! Ack, nack and defer match on `leased_by` and `delivery_count`, so a
//! worker whose lease was taken over cannot settle the new delivery.

use std::time::Duration;

use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use dte_core::error::AppError;
use dte_core::job::{Job, Priority};
use dte_core::job_queue::{Delivery, JobQueue, QueueEntry};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Durable priority queue shared by every worker process.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long `dequeue` sleeps between claim attempts on an empty queue.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn try_claim(&self, worker_id: &str) -> Result<Option<Delivery>, AppError> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE job_queue
            SET leased_by = $1,
                lease_expires_at = NOW() + make_interval(secs => $2),
                delivery_count = delivery_count + 1
            WHERE job_id = (
                SELECT job_id FROM job_queue
                WHERE (leased_by IS NULL AND visible_at <= NOW())
                   OR (leased_by IS NOT NULL AND lease_expires_at <= NOW())
                ORDER BY priority DESC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING job_id, priority, target_key, delivery_count
            "#,
        )
        .bind(worker_id)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|row| Delivery {
            entry: QueueEntry {
                job_id: row.job_id,
                priority: Priority::from_i16(row.priority),
                target_key: row.target_key,
            },
            worker_id: worker_id.to_string(),
            delivery_count: row.delivery_count.max(0) as u32,
        }))
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    job_id: Uuid,
    priority: i16,
    target_key: String,
    delivery_count: i32,
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::InfrastructureError(e.to_string())
}

fn delivery_count(delivery: &Delivery) -> i32 {
    i32::try_from(delivery.delivery_count).unwrap_or(i32::MAX)
}

impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<Uuid, AppError> {
        let entry = QueueEntry::for_job(job)?;

        sqlx::query(
            r#"
            INSERT INTO job_queue (job_id, priority, target_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(entry.job_id)
        .bind(entry.priority.as_i16())
        .bind(&entry.target_key)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(entry.job_id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_claim(worker_id).await? {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE job_id = $1 AND leased_by = $2 AND delivery_count = $3
            "#,
        )
        .bind(delivery.job_id())
        .bind(&delivery.worker_id)
        .bind(delivery_count(delivery))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<bool, AppError> {
        let result = if requeue {
            sqlx::query(
                r#"
                UPDATE job_queue
                SET leased_by = NULL, lease_expires_at = NULL, visible_at = NOW(),
                    seq = nextval(pg_get_serial_sequence('job_queue', 'seq'))
                WHERE job_id = $1 AND leased_by = $2 AND delivery_count = $3
                "#,
            )
        } else {
            sqlx::query(
                r#"
                DELETE FROM job_queue
                WHERE job_id = $1 AND leased_by = $2 AND delivery_count = $3
                "#,
            )
        }
        .bind(delivery.job_id())
        .bind(&delivery.worker_id)
        .bind(delivery_count(delivery))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET leased_by = NULL, lease_expires_at = NULL,
                visible_at = NOW() + make_interval(secs => $4),
                seq = nextval(pg_get_serial_sequence('job_queue', 'seq'))
            WHERE job_id = $1 AND leased_by = $2 AND delivery_count = $3
            "#,
        )
        .bind(delivery.job_id())
        .bind(&delivery.worker_id)
        .bind(delivery_count(delivery))
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool, AppError> {
        // An expired lease counts as waiting: its worker is presumed gone.
        let result = sqlx::query(
            r#"
            DELETE FROM job_queue
            WHERE job_id = $1
              AND (leased_by IS NULL OR lease_expires_at <= NOW())
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn depth(&self) -> Result<u64, AppError> {
        let (count,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM job_queue"#)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(count.max(0) as u64)
    }

    async fn release_worker(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET leased_by = NULL, lease_expires_at = NULL, visible_at = NOW()
            WHERE leased_by = $1
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}
