pub mod admission;
pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod proxy;
pub mod queue;
pub mod retry;
pub mod store;
pub mod traits;
pub mod util;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use admission::{AdmissionController, AdmissionDecision};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::EngineConfig;
pub use engine::{Engine, EngineHealth};
pub use error::{AppError, FailureClass};
pub use job::{
    Attempt, AttemptOutcome, HttpMethod, Job, JobRecord, JobStatus, JobTarget, Priority,
    SubmitJobRequest,
};
pub use job_queue::{Delivery, JobQueue, QueueEntry};
pub use proxy::{ProxyEntry, ProxyRotator};
pub use queue::InMemoryJobQueue;
pub use retry::{NextAction, RetryManager};
pub use store::InMemoryResultStore;
pub use traits::{ExecutionContext, Executor, ResultStore};
pub use util::compute_hash;
pub use worker::{TracingWorkerReporter, WorkerEvent, WorkerPool, WorkerReporter, WorkerService};
