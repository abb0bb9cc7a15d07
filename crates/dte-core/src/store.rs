//! In-process [`ResultStore`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Attempt, AttemptOutcome, Job, JobRecord, JobStatus};
use crate::traits::ResultStore;

/// Keeps every job and its attempts in memory. Nothing is ever evicted.
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    records: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, JobRecord>> {
        self.records.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned result store lock");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, JobRecord>> {
        self.records.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned result store lock");
            poisoned.into_inner()
        })
    }

    /// Apply `f` to a non-terminal job. `Ok(false)` if the job is terminal.
    fn mutate<F>(&self, job_id: Uuid, f: F) -> Result<bool, AppError>
    where
        F: FnOnce(&mut Job),
    {
        let mut records = self.write();
        let record = records.get_mut(&job_id).ok_or(AppError::NotFound(job_id))?;
        if record.job.status.is_terminal() {
            tracing::debug!(%job_id, status = %record.job.status, "Ignoring update to terminal job");
            return Ok(false);
        }
        f(&mut record.job);
        record.job.updated_at = Utc::now();
        Ok(true)
    }
}

impl ResultStore for InMemoryResultStore {
    async fn insert(&self, job: &Job) -> Result<(), AppError> {
        let mut records = self.write();
        if records.contains_key(&job.id) {
            return Err(AppError::ValidationError(format!(
                "Job {} already exists",
                job.id
            )));
        }
        records.insert(
            job.id,
            JobRecord {
                job: job.clone(),
                attempts: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_status(&self, job_id: Uuid) -> Result<JobRecord, AppError> {
        self.read()
            .get(&job_id)
            .cloned()
            .ok_or(AppError::NotFound(job_id))
    }

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<bool, AppError> {
        self.mutate(job_id, |job| job.status = status)
    }

    async fn begin_attempt(&self, job_id: Uuid, worker_id: &str) -> Result<Option<Job>, AppError> {
        let mut records = self.write();
        let record = records.get_mut(&job_id).ok_or(AppError::NotFound(job_id))?;
        let job = &mut record.job;
        if job.status.is_terminal() || !job.has_attempts_left() {
            return Ok(None);
        }
        job.attempt_count += 1;
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.next_attempt_at = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn record_outcome(
        &self,
        job_id: Uuid,
        attempt: &Attempt,
        result: Option<serde_json::Value>,
    ) -> Result<JobRecord, AppError> {
        let mut records = self.write();
        let record = records.get_mut(&job_id).ok_or(AppError::NotFound(job_id))?;
        if record.job.status.is_terminal() {
            tracing::debug!(%job_id, "Outcome for terminal job dropped");
            return Ok(record.clone());
        }

        record.attempts.push(attempt.clone());
        let job = &mut record.job;
        if attempt.outcome == AttemptOutcome::Succeeded {
            job.status = JobStatus::Succeeded;
            job.result = result;
            job.error_detail = None;
        } else {
            job.status = JobStatus::Failed;
            job.error_detail = attempt.error_detail.clone();
        }
        job.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        not_before: DateTime<Utc>,
        backoff: Duration,
    ) -> Result<bool, AppError> {
        self.mutate(job_id, |job| {
            job.status = JobStatus::Retrying;
            job.next_attempt_at = Some(not_before);
            job.last_backoff_ms = backoff.as_millis().min(u128::from(u64::MAX)) as u64;
        })
    }

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<bool, AppError> {
        self.mutate(job_id, |job| {
            job.status = JobStatus::DeadLettered;
            job.error_detail = Some(reason.to_string());
            job.next_attempt_at = None;
        })
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, u64)>, AppError> {
        let records = self.read();
        Ok(JobStatus::ALL
            .iter()
            .map(|status| {
                let n = records.values().filter(|r| r.job.status == *status).count();
                (*status, n as u64)
            })
            .collect())
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, AppError> {
        let records = self.read();
        let mut jobs: Vec<Job> = records
            .values()
            .filter(|r| status.is_none_or(|s| r.job.status == s))
            .map(|r| r.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}
