//! The engine facade: the only surface an outer layer (CLI, HTTP API) talks to.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::job::{Job, JobRecord, SubmitJobRequest};
use crate::job_queue::JobQueue;
use crate::proxy::ProxyRotator;
use crate::retry::RetryManager;
use crate::traits::{Executor, ResultStore};
use crate::worker::{TracingWorkerReporter, WorkerPool, WorkerReporter, WorkerService};

pub const CANCELLED_REASON: &str = "cancelled by caller";

/// Operational snapshot returned by [`Engine::health`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    /// Entries waiting or leased; `None` when the broker could not be reached.
    pub queue_depth: Option<u64>,
    /// Workers currently inside an attempt.
    pub active_workers: usize,
    pub pool_size: usize,
    pub proxy_pool_size: usize,
    pub available_proxies: usize,
    pub circuit_state: CircuitState,
    /// Last failure that counted against the infrastructure breaker.
    pub last_infrastructure_error: Option<String>,
    pub degraded: bool,
}

pub struct Engine<Q, S, E>
where
    Q: JobQueue,
    S: ResultStore,
    E: Executor,
{
    config: EngineConfig,
    queue: Q,
    store: S,
    proxies: Arc<ProxyRotator>,
    circuit_breaker: CircuitBreaker,
    service: WorkerService<Q, S, E>,
}

impl<Q, S, E> Engine<Q, S, E>
where
    Q: JobQueue,
    S: ResultStore,
    E: Executor,
{
    pub fn new(config: EngineConfig, queue: Q, store: S, executor: E) -> Self {
        let proxies = Arc::new(ProxyRotator::new(config.proxy.clone()));
        let circuit_breaker = CircuitBreaker::new("infrastructure", config.circuit_breaker.clone());
        let service = WorkerService::new(
            queue.clone(),
            store.clone(),
            executor,
            AdmissionController::new(config.rate_limit.clone()),
            Arc::clone(&proxies),
            Arc::new(RetryManager::new(config.retry.clone())),
            circuit_breaker.clone(),
            config.worker.clone(),
        );

        tracing::info!(
            workers = config.worker.concurrency,
            proxies = proxies.pool_size(),
            rotation = proxies.is_enabled(),
            "Engine configured"
        );

        Self {
            config,
            queue,
            store,
            proxies,
            circuit_breaker,
            service,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn proxies(&self) -> &ProxyRotator {
        &self.proxies
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Validate, persist and enqueue a job. Returns its id.
    ///
    /// Refused with `InfrastructureError` while the broker is considered down.
    pub async fn submit_job(&self, request: SubmitJobRequest) -> Result<Uuid, AppError> {
        let job = Job::new(request, self.config.retry.max_retries);
        job.validate()?;

        let cb = &self.circuit_breaker;
        cb.call(|| self.store.insert(&job)).await?;

        if let Err(e) = cb.call(|| self.queue.enqueue(&job)).await {
            let err = AppError::from(e);
            tracing::error!(job_id = %job.id, error = %err, "Enqueue failed after insert");
            // Don't leave a pending job that no worker will ever see.
            let reason = format!("enqueue failed: {err}");
            if let Err(cleanup) = self.store.dead_letter(job.id, &reason).await {
                tracing::warn!(job_id = %job.id, error = %cleanup, "Could not dead-letter unqueued job");
            }
            return Err(err);
        }

        tracing::info!(
            job_id = %job.id,
            kind = job.target.kind(),
            priority = ?job.priority,
            "Job submitted"
        );
        Ok(job.id)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobRecord, AppError> {
        Ok(self
            .circuit_breaker
            .call(|| self.store.get_status(job_id))
            .await?)
    }

    /// Dead-letter a job between attempts. Returns `false` if it was already terminal.
    ///
    /// An attempt in flight is not interrupted; its outcome is discarded.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, AppError> {
        let cb = &self.circuit_breaker;
        let cancelled = cb
            .call(|| self.store.dead_letter(job_id, CANCELLED_REASON))
            .await?;
        if !cancelled {
            return Ok(false);
        }

        // A leased entry stays put; its worker acks it on seeing the terminal status.
        match cb.call(|| self.queue.remove(job_id)).await {
            Ok(removed) => tracing::info!(%job_id, removed_from_queue = removed, "Job cancelled"),
            Err(e) => tracing::warn!(%job_id, error = %e, "Job cancelled, queue cleanup deferred"),
        }
        Ok(true)
    }

    /// Never fails; an unreachable broker shows up as `degraded`.
    pub async fn health(&self) -> EngineHealth {
        let queue_depth = match self.circuit_breaker.call(|| self.queue.depth()).await {
            Ok(depth) => Some(depth),
            Err(e) => {
                tracing::warn!(error = %e, "Queue depth unavailable");
                None
            }
        };
        let circuit = self.circuit_breaker.stats();
        let circuit_state = circuit.state;

        EngineHealth {
            queue_depth,
            active_workers: self.service.busy_workers(),
            pool_size: self.config.worker.concurrency,
            proxy_pool_size: self.proxies.pool_size(),
            available_proxies: self.proxies.available(),
            circuit_state,
            last_infrastructure_error: circuit.last_error,
            degraded: queue_depth.is_none() || circuit_state != CircuitState::Closed,
        }
    }

    /// Start the worker pool with tracing-based reporting.
    pub fn start(&self, cancel_token: CancellationToken) -> WorkerPool {
        self.start_with_reporter(Arc::new(TracingWorkerReporter), cancel_token)
    }

    pub fn start_with_reporter<WR>(&self, reporter: Arc<WR>, cancel_token: CancellationToken) -> WorkerPool
    where
        WR: WorkerReporter + 'static,
    {
        WorkerPool::spawn(self.service.clone(), reporter, cancel_token)
    }
}
