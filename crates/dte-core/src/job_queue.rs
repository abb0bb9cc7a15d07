use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, Priority};

/// What the queue knows about a job. Everything else lives in the result store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub priority: Priority,
    pub target_key: String,
}

impl QueueEntry {
    /// Validates the job and derives its entry.
    pub fn for_job(job: &Job) -> Result<Self, AppError> {
        job.validate()?;
        Ok(Self {
            job_id: job.id,
            priority: job.priority,
            target_key: job.target.target_key()?,
        })
    }
}

/// A dequeued entry leased to one worker until acked, nacked or deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub entry: QueueEntry,
    pub worker_id: String,
    /// 1 for the first delivery; higher after visibility-timeout redeliveries.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn job_id(&self) -> Uuid {
        self.entry.job_id
    }
}

/// Priority job queue with at-least-once delivery.
///
/// Ordering is priority first, then FIFO within a tier. A delivery that is
/// neither acked nor nacked within the visibility timeout becomes visible
/// again, so a crashed worker never loses a job.
pub trait JobQueue: Send + Sync + Clone + 'static {
    /// Enqueue a job. Fails with `ValidationError` if its target or payload is malformed.
    fn enqueue(&self, job: &Job) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Lease the next visible entry, suspending up to `timeout`.
    ///
    /// Returns `None` on timeout rather than an error.
    fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Delivery>, AppError>> + Send;

    /// Remove a leased entry for good.
    ///
    /// Returns `false` unless `delivery` is still the current lease: once a
    /// lease expires and the entry is redelivered, the old holder's ack,
    /// nack and defer are all refused.
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Give a lease back: immediately visible again if `requeue`, dropped otherwise.
    fn nack(
        &self,
        delivery: &Delivery,
        requeue: bool,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Give a lease back and keep the entry invisible for `delay`.
    fn defer(
        &self,
        delivery: &Delivery,
        delay: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Drop an entry that is waiting (not leased). Used for cancellation.
    fn remove(&self, job_id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Entries waiting or leased.
    fn depth(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Make every lease held by `worker_id` visible again (graceful shutdown).
    fn release_worker(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
