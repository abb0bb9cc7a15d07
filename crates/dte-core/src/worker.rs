//! Worker pool.
//!
//! Each worker runs the same loop: dequeue, admission check, proxy
//! assignment, execute under a hard timeout, classify, record, then ack or
//! defer the queue entry. Per-job errors are classified and recorded, never
//! propagated out of the loop. Broker and store calls go through the shared
//! infrastructure circuit breaker; while it is open, workers stop pulling
//! new work.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionDecision};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::WorkerConfig;
use crate::error::{AppError, FailureClass};
use crate::job::{Attempt, AttemptOutcome, JobStatus};
use crate::job_queue::{Delivery, JobQueue};
use crate::proxy::ProxyRotator;
use crate::retry::{NextAction, RetryManager};
use crate::traits::{ExecutionContext, Executor, ResultStore};

/// Events emitted by workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    /// Infrastructure breaker is open; not pulling work.
    Paused {
        retry_after: Duration,
    },
    JobClaimed {
        job_id: Uuid,
        delivery_count: u32,
    },
    /// Delivery acked without an attempt (job already terminal).
    JobSkipped {
        job_id: Uuid,
        status: JobStatus,
    },
    JobDeferred {
        job_id: Uuid,
        delay: Duration,
        reason: &'a str,
    },
    AttemptStarted {
        job_id: Uuid,
        attempt: u32,
        url: &'a str,
        proxy: Option<&'a str>,
    },
    JobSucceeded {
        job_id: Uuid,
        attempt: u32,
    },
    JobFailed {
        job_id: Uuid,
        attempt: u32,
        error: &'a str,
        will_retry: bool,
    },
    JobDeadLettered {
        job_id: Uuid,
        reason: &'a str,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for jobs");
            }
            WorkerEvent::Paused { retry_after } => {
                tracing::warn!(
                    retry_after_ms = %retry_after.as_millis(),
                    "Infrastructure unavailable, worker paused"
                );
            }
            WorkerEvent::JobClaimed {
                job_id,
                delivery_count,
            } => {
                tracing::debug!(%job_id, %delivery_count, "Job claimed");
            }
            WorkerEvent::JobSkipped { job_id, status } => {
                tracing::debug!(%job_id, %status, "Job already terminal, skipped");
            }
            WorkerEvent::JobDeferred {
                job_id,
                delay,
                reason,
            } => {
                tracing::debug!(%job_id, delay_ms = %delay.as_millis(), %reason, "Job deferred");
            }
            WorkerEvent::AttemptStarted {
                job_id,
                attempt,
                url,
                proxy,
            } => {
                tracing::info!(%job_id, %attempt, %url, proxy = proxy.unwrap_or("-"), "Attempt started");
            }
            WorkerEvent::JobSucceeded { job_id, attempt } => {
                tracing::info!(%job_id, %attempt, "Job succeeded");
            }
            WorkerEvent::JobFailed {
                job_id,
                attempt,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %attempt, %error, %will_retry, "Attempt failed");
            }
            WorkerEvent::JobDeadLettered { job_id, reason } => {
                tracing::warn!(%job_id, %reason, "Job dead-lettered");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Decrements the busy-worker gauge when an attempt finishes, however it ends.
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a worker loop needs. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerService<Q, S, E>
where
    Q: JobQueue,
    S: ResultStore,
    E: Executor,
{
    queue: Q,
    store: S,
    executor: E,
    admission: AdmissionController,
    proxies: Arc<ProxyRotator>,
    retry: Arc<RetryManager>,
    circuit_breaker: CircuitBreaker,
    config: WorkerConfig,
    busy: Arc<AtomicUsize>,
}

impl<Q, S, E> WorkerService<Q, S, E>
where
    Q: JobQueue,
    S: ResultStore,
    E: Executor,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Q,
        store: S,
        executor: E,
        admission: AdmissionController,
        proxies: Arc<ProxyRotator>,
        retry: Arc<RetryManager>,
        circuit_breaker: CircuitBreaker,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            executor,
            admission,
            proxies,
            retry,
            circuit_breaker,
            config,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Workers currently inside an attempt.
    pub fn busy_workers(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run one worker loop until `cancel_token` fires.
    ///
    /// An attempt already in flight when cancellation arrives runs to
    /// completion (bounded by the fetch timeout). Leases still held on exit
    /// are released so other workers can pick them up at once.
    pub async fn run<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started { worker_id });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            if self.circuit_breaker.is_open() {
                let retry_after = self.circuit_breaker.retry_after();
                reporter.report(WorkerEvent::Paused { retry_after });
                tokio::select! {
                    () = tokio::time::sleep(retry_after.min(self.config.poll_timeout)) => {}
                    () = cancel_token.cancelled() => break,
                }
                continue;
            }

            reporter.report(WorkerEvent::Polling);

            let dequeued = tokio::select! {
                res = self.circuit_breaker.call(|| {
                    self.queue.dequeue(worker_id, self.config.poll_timeout)
                }) => res.map_err(AppError::from),
                () = cancel_token.cancelled() => break,
            };

            match dequeued {
                Ok(Some(delivery)) => {
                    let _busy = BusyGuard::enter(&self.busy);
                    reporter.report(WorkerEvent::JobClaimed {
                        job_id: delivery.job_id(),
                        delivery_count: delivery.delivery_count,
                    });
                    if let Err(e) = self.process_delivery(worker_id, &delivery, reporter).await {
                        tracing::error!(job_id = %delivery.job_id(), error = %e, "Infrastructure error while processing job");
                        // Hand the lease back; the visibility timeout covers us if this fails too.
                        let _ = self
                            .circuit_breaker
                            .call(|| self.queue.nack(&delivery, true))
                            .await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Failed to dequeue job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_timeout) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        let jobs_released = match self.queue.release_worker(worker_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(%worker_id, error = %e, "Failed to release leases on shutdown");
                0
            }
        };

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id,
            jobs_released,
        });
        reporter.report(WorkerEvent::Stopped { worker_id });

        Ok(())
    }

    /// Drive one delivery to an ack, a defer or a dead letter.
    ///
    /// Only infrastructure errors are returned; everything the target does
    /// is recorded on the job.
    async fn process_delivery<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        delivery: &Delivery,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let job_id = delivery.job_id();
        let target_key = delivery.entry.target_key.as_str();
        let cb = &self.circuit_breaker;

        let record = match cb.call(|| self.store.get_status(job_id)).await {
            Ok(record) => record,
            Err(e) => match AppError::from(e) {
                AppError::NotFound(_) => {
                    tracing::warn!(%job_id, "Queue entry without a stored job, dropping");
                    cb.call(|| self.queue.ack(delivery)).await?;
                    return Ok(());
                }
                other => return Err(other),
            },
        };

        if record.status().is_terminal() {
            reporter.report(WorkerEvent::JobSkipped {
                job_id,
                status: record.status(),
            });
            cb.call(|| self.queue.ack(delivery)).await?;
            return Ok(());
        }

        // Checked before admission so a spent job never takes a rate-limit token.
        if !record.job.has_attempts_left() {
            return self
                .dead_letter_exhausted(delivery, record.job.attempt_count, reporter)
                .await;
        }

        if let AdmissionDecision::Denied { retry_after } = self.admission.try_admit(target_key).await {
            let delay = retry_after.max(self.admission.denied_retry_delay());
            cb.call(|| self.queue.defer(delivery, delay)).await?;
            reporter.report(WorkerEvent::JobDeferred {
                job_id,
                delay,
                reason: "rate limit",
            });
            return Ok(());
        }
        cb.call(|| self.store.set_status(job_id, JobStatus::Admitted))
            .await?;

        let proxy = self.proxies.assign(target_key).map(|p| p.address);
        if proxy.is_none() && self.proxies.is_enabled() {
            tracing::debug!(%job_id, key = %target_key, "No proxy available, going direct");
        }

        let Some(job) = cb
            .call(|| self.store.begin_attempt(job_id, worker_id))
            .await?
        else {
            // Another delivery started the last attempt, or the job went
            // terminal, since the status read above.
            return self
                .dead_letter_exhausted(delivery, record.job.attempt_count, reporter)
                .await;
        };

        let attempt_number = job.attempt_count;
        reporter.report(WorkerEvent::AttemptStarted {
            job_id,
            attempt: attempt_number,
            url: job.target.url(),
            proxy: proxy.as_deref(),
        });

        let ctx = ExecutionContext {
            job_id,
            attempt_number,
            proxy: proxy.clone(),
            timeout: self.config.fetch_timeout,
            payload: job.payload.clone(),
        };
        let started_at = Utc::now();
        let result = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.executor.execute(&job.target, &ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(self.config.fetch_timeout.as_secs())),
        };
        let ended_at = Utc::now();

        match result {
            Ok(value) => {
                if let Some(address) = &proxy {
                    self.proxies.report(address, true);
                }
                let attempt = Attempt {
                    job_id,
                    attempt_number,
                    assigned_proxy: proxy,
                    started_at,
                    ended_at,
                    outcome: AttemptOutcome::Succeeded,
                    error_detail: None,
                };
                cb.call(|| self.store.record_outcome(job_id, &attempt, Some(value)))
                    .await?;
                cb.call(|| self.queue.ack(delivery)).await?;
                reporter.report(WorkerEvent::JobSucceeded {
                    job_id,
                    attempt: attempt_number,
                });
            }
            Err(error) => {
                let outcome = AttemptOutcome::from_error(&error);
                let class = outcome.failure_class().unwrap_or(FailureClass::Permanent);
                if let Some(address) = &proxy {
                    // A permanent error is the target's fault, not the proxy's.
                    self.proxies.report(address, class == FailureClass::Permanent);
                }

                let error_detail = error.to_string();
                let attempt = Attempt {
                    job_id,
                    attempt_number,
                    assigned_proxy: proxy,
                    started_at,
                    ended_at,
                    outcome,
                    error_detail: Some(error_detail.clone()),
                };
                let updated = cb
                    .call(|| self.store.record_outcome(job_id, &attempt, None))
                    .await?;
                if updated.status().is_terminal() {
                    // Cancelled while the attempt was in flight.
                    cb.call(|| self.queue.ack(delivery)).await?;
                    return Ok(());
                }

                let action = self
                    .retry
                    .on_failure(&updated.job, &attempt, class, error.retry_after());
                reporter.report(WorkerEvent::JobFailed {
                    job_id,
                    attempt: attempt_number,
                    error: &error_detail,
                    will_retry: action.will_retry(),
                });

                match action {
                    NextAction::Retry {
                        delay,
                        backoff,
                        not_before,
                    } => {
                        cb.call(|| self.store.schedule_retry(job_id, not_before, backoff))
                            .await?;
                        cb.call(|| self.queue.defer(delivery, delay)).await?;
                        reporter.report(WorkerEvent::JobDeferred {
                            job_id,
                            delay,
                            reason: "retry backoff",
                        });
                    }
                    NextAction::DeadLetter { reason } => {
                        cb.call(|| self.store.dead_letter(job_id, &reason)).await?;
                        cb.call(|| self.queue.ack(delivery)).await?;
                        reporter.report(WorkerEvent::JobDeadLettered {
                            job_id,
                            reason: &reason,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Dead-letter a job whose attempt budget is spent without a recorded
    /// decision (a worker crashed mid-attempt), then drop its entry.
    async fn dead_letter_exhausted<WR: WorkerReporter>(
        &self,
        delivery: &Delivery,
        attempt_count: u32,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let job_id = delivery.job_id();
        let cb = &self.circuit_breaker;
        let reason = format!("retries exhausted after {attempt_count} attempts");
        // `false` when the job is already terminal (e.g. cancelled).
        if cb.call(|| self.store.dead_letter(job_id, &reason)).await? {
            reporter.report(WorkerEvent::JobDeadLettered {
                job_id,
                reason: &reason,
            });
        }
        cb.call(|| self.queue.ack(delivery)).await?;
        Ok(())
    }
}

/// A running set of workers sharing one [`WorkerService`].
pub struct WorkerPool {
    tracker: TaskTracker,
    cancel_token: CancellationToken,
    size: usize,
}

impl WorkerPool {
    /// Spawn `service.config().concurrency` workers. They stop when
    /// `cancel_token` (or [`shutdown`](Self::shutdown)) fires.
    pub fn spawn<Q, S, E, WR>(
        service: WorkerService<Q, S, E>,
        reporter: Arc<WR>,
        cancel_token: CancellationToken,
    ) -> Self
    where
        Q: JobQueue,
        S: ResultStore,
        E: Executor,
        WR: WorkerReporter + 'static,
    {
        let tracker = TaskTracker::new();
        let size = service.config.concurrency.max(1);

        for index in 0..size {
            let service = service.clone();
            let reporter = Arc::clone(&reporter);
            let token = cancel_token.clone();
            let worker_id = format!("{}-{}", service.config.worker_id_prefix, index);
            tracker.spawn(async move {
                if let Err(e) = service.run(&worker_id, token, reporter.as_ref()).await {
                    tracing::error!(%worker_id, error = %e, "Worker exited with error");
                }
            });
        }
        tracker.close();

        Self {
            tracker,
            cancel_token,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Ask every worker to stop after its current attempt.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Wait until every worker has exited.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    pub fn is_finished(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }
}
