use std::time::Duration;

use dte_core::job::Priority;
use dte_core::job_queue::{Delivery, JobQueue, QueueEntry};
use dte_db::PgJobQueue;

use crate::integration::common::{setup_test_db, test_job, test_job_with_priority};

const LEASE: Duration = Duration::from_secs(30);
const SHORT: Duration = Duration::from_millis(50);

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn enqueue_then_dequeue_returns_entry() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let job = test_job("https://example.com/a");
    let id = queue.enqueue(&job).await.unwrap();
    assert_eq!(id, job.id);
    assert_eq!(queue.depth().await.unwrap(), 1);

    let delivery = queue.dequeue("w-1", SHORT).await.unwrap().unwrap();
    assert_eq!(delivery.job_id(), job.id);
    assert_eq!(delivery.worker_id, "w-1");
    assert_eq!(delivery.delivery_count, 1);
    assert_eq!(delivery.entry.target_key, "https://example.com:443");
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn dequeue_empty_queue_times_out_with_none() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE).with_poll_interval(Duration::from_millis(20));

    assert!(queue.dequeue("w-1", SHORT).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn enqueue_rejects_malformed_target() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let job = test_job("not a url");
    assert!(queue.enqueue(&job).await.is_err());
    assert_eq!(queue.depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn enqueue_is_idempotent_per_job() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let job = test_job("https://example.com");
    queue.enqueue(&job).await.unwrap();
    queue.enqueue(&job).await.unwrap();
    assert_eq!(queue.depth().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn dequeue_orders_by_priority_then_fifo() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let low = test_job_with_priority("https://example.com/low", Priority::Low);
    let first = test_job("https://example.com/1");
    let second = test_job("https://example.com/2");
    let high = test_job_with_priority("https://example.com/high", Priority::High);
    for job in [&low, &first, &second, &high] {
        queue.enqueue(job).await.unwrap();
    }

    let mut order = Vec::new();
    while let Some(delivery) = queue.dequeue("w-1", SHORT).await.unwrap() {
        order.push(delivery.job_id());
    }
    assert_eq!(order, vec![high.id, first.id, second.id, low.id]);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn concurrent_workers_never_share_a_lease() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    for i in 0..10 {
        queue
            .enqueue(&test_job(&format!("https://example.com/{i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("w-{w}");
            let mut claimed = Vec::new();
            while let Some(delivery) = queue.dequeue(&worker, SHORT).await.unwrap() {
                claimed.push(delivery.job_id());
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 10);
    assert_eq!(all.len(), 10);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn ack_removes_leased_entry() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let job = test_job("https://example.com");
    queue.enqueue(&job).await.unwrap();
    // Not leased yet.
    let unleased = Delivery {
        entry: QueueEntry::for_job(&job).unwrap(),
        worker_id: "w-1".to_string(),
        delivery_count: 1,
    };
    assert!(!queue.ack(&unleased).await.unwrap());

    let delivery = queue.dequeue("w-1", SHORT).await.unwrap().unwrap();
    assert!(queue.ack(&delivery).await.unwrap());
    assert_eq!(queue.depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn nack_requeue_makes_entry_visible_again() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let job = test_job("https://example.com");
    queue.enqueue(&job).await.unwrap();
    let first = queue.dequeue("w-1", SHORT).await.unwrap().unwrap();

    assert!(queue.nack(&first, true).await.unwrap());
    let again = queue.dequeue("w-2", SHORT).await.unwrap().unwrap();
    assert_eq!(again.job_id(), job.id);
    assert_eq!(again.delivery_count, 2);

    assert!(queue.nack(&again, false).await.unwrap());
    assert_eq!(queue.depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn expired_lease_is_redelivered() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(20));

    let job = test_job("https://example.com");
    queue.enqueue(&job).await.unwrap();
    queue.dequeue("crashed", SHORT).await.unwrap().unwrap();
    assert!(queue.dequeue("w-2", SHORT).await.unwrap().is_none());

    let redelivered = queue
        .dequeue("w-2", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.job_id(), job.id);
    assert_eq!(redelivered.worker_id, "w-2");
    assert_eq!(redelivered.delivery_count, 2);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn stale_lease_holder_cannot_settle_redelivered_entry() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, Duration::from_millis(500))
        .with_poll_interval(Duration::from_millis(20));

    let job = test_job("https://example.com");
    queue.enqueue(&job).await.unwrap();
    let stale = queue.dequeue("slow", SHORT).await.unwrap().unwrap();
    let current = queue
        .dequeue("w-2", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();

    assert!(!queue.ack(&stale).await.unwrap());
    assert!(!queue.defer(&stale, Duration::from_secs(5)).await.unwrap());
    assert!(!queue.nack(&stale, false).await.unwrap());
    assert_eq!(queue.depth().await.unwrap(), 1);

    assert!(queue.ack(&current).await.unwrap());
    assert_eq!(queue.depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn defer_hides_entry_until_delay_elapses() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE).with_poll_interval(Duration::from_millis(20));

    let job = test_job("https://example.com");
    queue.enqueue(&job).await.unwrap();
    let delivery = queue.dequeue("w-1", SHORT).await.unwrap().unwrap();

    assert!(queue.defer(&delivery, Duration::from_millis(300)).await.unwrap());
    assert!(queue.dequeue("w-1", SHORT).await.unwrap().is_none());
    assert_eq!(queue.depth().await.unwrap(), 1);

    let later = queue
        .dequeue("w-1", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(later.job_id(), job.id);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn remove_only_drops_waiting_entries() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let waiting = test_job("https://example.com/waiting");
    let leased = test_job("https://example.com/leased");
    queue.enqueue(&leased).await.unwrap();
    queue.dequeue("w-1", SHORT).await.unwrap().unwrap();
    queue.enqueue(&waiting).await.unwrap();

    assert!(queue.remove(waiting.id).await.unwrap());
    assert!(!queue.remove(leased.id).await.unwrap());
    assert_eq!(queue.depth().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn release_worker_returns_its_leases() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool, LEASE);

    let a = test_job("https://example.com/a");
    let b = test_job("https://example.com/b");
    queue.enqueue(&a).await.unwrap();
    queue.enqueue(&b).await.unwrap();
    queue.dequeue("w-1", SHORT).await.unwrap().unwrap();
    queue.dequeue("w-2", SHORT).await.unwrap().unwrap();

    assert_eq!(queue.release_worker("w-1").await.unwrap(), 1);
    assert_eq!(queue.release_worker("w-1").await.unwrap(), 0);

    let again = queue.dequeue("w-3", SHORT).await.unwrap().unwrap();
    assert_eq!(again.job_id(), a.id);
}
