//! Test utilities: mock executor, reporter and queue, plus job fixtures.
//!
//! Handwritten mocks for dependency injection in unit tests. They use
//! `Arc<Mutex<_>>` for interior mutability so tests can assert on what was
//! recorded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Attempt, AttemptOutcome, Job, JobTarget, SubmitJobRequest};
use crate::job_queue::{Delivery, JobQueue};
use crate::traits::{ExecutionContext, Executor};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn make_test_job() -> Job {
    Job::new(
        SubmitJobRequest::new(JobTarget::http_fetch("https://example.com/page")),
        5,
    )
}

pub fn succeeded_attempt(job: &Job) -> Attempt {
    Attempt {
        job_id: job.id,
        attempt_number: job.attempt_count,
        assigned_proxy: None,
        started_at: Utc::now(),
        ended_at: Utc::now(),
        outcome: AttemptOutcome::Succeeded,
        error_detail: None,
    }
}

pub fn failed_attempt(job: &Job, outcome: AttemptOutcome) -> Attempt {
    Attempt {
        job_id: job.id,
        attempt_number: job.attempt_count,
        assigned_proxy: None,
        started_at: Utc::now(),
        ended_at: Utc::now(),
        outcome,
        error_detail: Some("connection reset".into()),
    }
}

// ---------------------------------------------------------------------------
// MockExecutor
// ---------------------------------------------------------------------------

/// Executor that replays a scripted list of results.
///
/// Each call pops the first response; once the script runs out every call
/// succeeds with `{"status": 200}`.
#[derive(Clone, Default)]
pub struct MockExecutor {
    responses: Arc<Mutex<Vec<Result<serde_json::Value, AppError>>>>,
    calls: Arc<Mutex<Vec<ExecutionContext>>>,
    delay: Option<Duration>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ExecutionContext> {
        self.calls.lock().unwrap().clone()
    }

    pub fn proxies_used(&self) -> Vec<Option<String>> {
        self.calls().into_iter().map(|c| c.proxy).collect()
    }
}

impl Executor for MockExecutor {
    async fn execute(
        &self,
        _target: &JobTarget,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, AppError> {
        self.calls.lock().unwrap().push(ctx.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = {
            let mut responses = self.responses.lock().unwrap();
            (!responses.is_empty()).then(|| responses.remove(0))
        };
        next.unwrap_or_else(|| Ok(serde_json::json!({"status": 200})))
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a short label per event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == label).count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match event {
            WorkerEvent::Started { .. } => "started",
            WorkerEvent::Polling => return,
            WorkerEvent::Paused { .. } => "paused",
            WorkerEvent::JobClaimed { .. } => "claimed",
            WorkerEvent::JobSkipped { .. } => "skipped",
            WorkerEvent::JobDeferred { .. } => "deferred",
            WorkerEvent::AttemptStarted { .. } => "attempt",
            WorkerEvent::JobSucceeded { .. } => "succeeded",
            WorkerEvent::JobFailed { .. } => "failed",
            WorkerEvent::JobDeadLettered { .. } => "dead_lettered",
            WorkerEvent::ShuttingDown { .. } => "shutting_down",
            WorkerEvent::Stopped { .. } => "stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// UnavailableQueue
// ---------------------------------------------------------------------------

/// Queue whose broker is always unreachable.
#[derive(Clone, Default)]
pub struct UnavailableQueue;

fn broker_down() -> AppError {
    AppError::InfrastructureError("broker unreachable".into())
}

impl JobQueue for UnavailableQueue {
    async fn enqueue(&self, _job: &Job) -> Result<Uuid, AppError> {
        Err(broker_down())
    }

    async fn dequeue(
        &self,
        _worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, AppError> {
        tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
        Err(broker_down())
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<bool, AppError> {
        Err(broker_down())
    }

    async fn nack(&self, _delivery: &Delivery, _requeue: bool) -> Result<bool, AppError> {
        Err(broker_down())
    }

    async fn defer(&self, _delivery: &Delivery, _delay: Duration) -> Result<bool, AppError> {
        Err(broker_down())
    }

    async fn remove(&self, _job_id: Uuid) -> Result<bool, AppError> {
        Err(broker_down())
    }

    async fn depth(&self) -> Result<u64, AppError> {
        Err(broker_down())
    }

    async fn release_worker(&self, _worker_id: &str) -> Result<u64, AppError> {
        Err(broker_down())
    }
}
