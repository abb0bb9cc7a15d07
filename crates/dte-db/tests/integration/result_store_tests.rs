use std::time::Duration;

use chrono::Utc;
use dte_core::error::AppError;
use dte_core::job::{Attempt, AttemptOutcome, Job, JobStatus};
use dte_core::traits::ResultStore;
use dte_db::PgResultStore;
use uuid::Uuid;

use crate::integration::common::{setup_test_db, test_job};

fn attempt(job: &Job, outcome: AttemptOutcome) -> Attempt {
    Attempt {
        job_id: job.id,
        attempt_number: job.attempt_count,
        assigned_proxy: Some("http://proxy-1:8080".into()),
        started_at: Utc::now(),
        ended_at: Utc::now(),
        outcome,
        error_detail: (outcome != AttemptOutcome::Succeeded).then(|| "connection reset".into()),
    }
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn insert_and_get_status_roundtrip() {
    let (pool, _container) = setup_test_db().await;
    let store = PgResultStore::new(pool);

    let job = test_job("https://example.com");
    store.insert(&job).await.unwrap();

    let record = store.get_status(job.id).await.unwrap();
    assert_eq!(record.job.id, job.id);
    assert_eq!(record.job.target, job.target);
    assert_eq!(record.status(), JobStatus::Pending);
    assert_eq!(record.job.attempt_count, 0);
    assert_eq!(record.job.max_retries, 3);
    assert!(record.attempts.is_empty());
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn duplicate_insert_is_rejected() {
    let (pool, _container) = setup_test_db().await;
    let store = PgResultStore::new(pool);

    let job = test_job("https://example.com");
    store.insert(&job).await.unwrap();
    assert!(matches!(
        store.insert(&job).await,
        Err(AppError::ValidationError(_))
    ));
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn unknown_job_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let store = PgResultStore::new(pool);

    let id = Uuid::new_v4();
    assert!(matches!(
        store.get_status(id).await,
        Err(AppError::NotFound(missing)) if missing == id
    ));
    assert!(matches!(
        store.dead_letter(id, "gone").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn attempt_lifecycle_until_success() {
    let (pool, _container) = setup_test_db().await;
    let store = PgResultStore::new(pool);

    let job = test_job("https://example.com");
    store.insert(&job).await.unwrap();

    let running = store.begin_attempt(job.id, "w-1").await.unwrap().unwrap();
    assert_eq!(running.attempt_count, 1);
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.worker_id.as_deref(), Some("w-1"));

    let record = store
        .record_outcome(job.id, &attempt(&running, AttemptOutcome::TransientError), None)
        .await
        .unwrap();
    assert_eq!(record.status(), JobStatus::Failed);
    assert_eq!(record.job.error_detail.as_deref(), Some("connection reset"));

    let not_before = Utc::now() + chrono::Duration::seconds(2);
    assert!(
        store
            .schedule_retry(job.id, not_before, Duration::from_secs(2))
            .await
            .unwrap()
    );
    let record = store.get_status(job.id).await.unwrap();
    assert_eq!(record.status(), JobStatus::Retrying);
    assert_eq!(record.job.last_backoff_ms, 2000);
    assert!(record.job.next_attempt_at.is_some());

    let running = store.begin_attempt(job.id, "w-2").await.unwrap().unwrap();
    assert_eq!(running.attempt_count, 2);
    assert!(running.next_attempt_at.is_none());

    let record = store
        .record_outcome(
            job.id,
            &attempt(&running, AttemptOutcome::Succeeded),
            Some(serde_json::json!({"status": 200})),
        )
        .await
        .unwrap();
    assert_eq!(record.status(), JobStatus::Succeeded);
    assert_eq!(record.job.result, Some(serde_json::json!({"status": 200})));
    assert!(record.job.error_detail.is_none());
    let numbers: Vec<u32> = record.attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(
        record.attempts[0].assigned_proxy.as_deref(),
        Some("http://proxy-1:8080")
    );
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn begin_attempt_stops_at_attempt_budget() {
    let (pool, _container) = setup_test_db().await;
    let store = PgResultStore::new(pool);

    let mut job = test_job("https://example.com");
    job.max_retries = 1;
    store.insert(&job).await.unwrap();

    assert!(store.begin_attempt(job.id, "w-1").await.unwrap().is_some());
    assert!(store.begin_attempt(job.id, "w-1").await.unwrap().is_some());
    assert!(store.begin_attempt(job.id, "w-1").await.unwrap().is_none());
    assert_eq!(store.get_status(job.id).await.unwrap().job.attempt_count, 2);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn terminal_jobs_are_not_rewritten() {
    let (pool, _container) = setup_test_db().await;
    let store = PgResultStore::new(pool);

    let job = test_job("https://example.com");
    store.insert(&job).await.unwrap();
    assert!(store.dead_letter(job.id, "cancelled by caller").await.unwrap());

    assert!(!store.dead_letter(job.id, "again").await.unwrap());
    assert!(!store.set_status(job.id, JobStatus::Running).await.unwrap());
    assert!(store.begin_attempt(job.id, "w-1").await.unwrap().is_none());

    let stale = attempt(&job, AttemptOutcome::Succeeded);
    let record = store.record_outcome(job.id, &stale, None).await.unwrap();
    assert_eq!(record.status(), JobStatus::DeadLettered);
    assert_eq!(record.job.error_detail.as_deref(), Some("cancelled by caller"));
    assert!(record.attempts.is_empty());
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn count_and_list_by_status() {
    let (pool, _container) = setup_test_db().await;
    let store = PgResultStore::new(pool);

    let a = test_job("https://example.com/a");
    let b = test_job("https://example.com/b");
    let c = test_job("https://example.com/c");
    for job in [&a, &b, &c] {
        store.insert(job).await.unwrap();
    }
    store.dead_letter(c.id, "permanent").await.unwrap();

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.len(), JobStatus::ALL.len());
    let count = |s: JobStatus| counts.iter().find(|(st, _)| *st == s).unwrap().1;
    assert_eq!(count(JobStatus::Pending), 2);
    assert_eq!(count(JobStatus::DeadLettered), 1);
    assert_eq!(count(JobStatus::Succeeded), 0);

    let pending = store.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|j| j.status == JobStatus::Pending));

    assert_eq!(store.list_jobs(None, 2).await.unwrap().len(), 2);
}
