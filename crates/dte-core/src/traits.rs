use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Attempt, Job, JobRecord, JobStatus, JobTarget};

/// Per-attempt context handed to an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: Uuid,
    pub attempt_number: u32,
    /// Egress proxy URL, if one was assigned.
    pub proxy: Option<String>,
    /// The worker enforces this as a hard limit; executors may also use it
    /// to size their own client timeouts.
    pub timeout: Duration,
    pub payload: serde_json::Value,
}

/// Performs the network work of one attempt.
///
/// Implementations must classify failures into the fetch-time variants of
/// [`AppError`] (transient, timeout, remote rate limit, permanent) so the
/// retry policy can act on them.
pub trait Executor: Send + Sync + Clone + 'static {
    fn execute(
        &self,
        target: &JobTarget,
        ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Authoritative job state and attempt history.
///
/// Once a job reaches a terminal status every mutator is a no-op for it, so
/// readers never observe a terminal job regress.
pub trait ResultStore: Send + Sync + Clone + 'static {
    /// Persist a freshly submitted job.
    fn insert(&self, job: &Job) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Job plus attempt history, or `NotFound`.
    fn get_status(&self, job_id: Uuid)
    -> impl Future<Output = Result<JobRecord, AppError>> + Send;

    /// Move a non-terminal job to `status`. Returns `false` if it was terminal.
    fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Claim the next attempt: bumps `attempt_count` and marks the job running.
    ///
    /// Returns `None` if the job is terminal or has used all its attempts.
    fn begin_attempt(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Append a finished attempt. A success stores `result` and makes the job
    /// `Succeeded`; a failure makes it `Failed` until the retry decision is applied.
    fn record_outcome(
        &self,
        job_id: Uuid,
        attempt: &Attempt,
        result: Option<serde_json::Value>,
    ) -> impl Future<Output = Result<JobRecord, AppError>> + Send;

    /// Mark the job `Retrying` until `not_before`, remembering the un-jittered backoff.
    fn schedule_retry(
        &self,
        job_id: Uuid,
        not_before: DateTime<Utc>,
        backoff: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Make the job terminal with `reason` as its error detail.
    fn dead_letter(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Job count for every status, in [`JobStatus::ALL`] order.
    fn count_by_status(
        &self,
    ) -> impl Future<Output = Result<Vec<(JobStatus, u64)>, AppError>> + Send;

    /// Most recently created jobs first.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;
}
