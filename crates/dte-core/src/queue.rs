//! In-process [`JobQueue`] implementation.
//!
//! Entries move between three states: ready (ordered by priority, then
//! arrival), delayed (invisible until a deadline) and leased (held by a
//! worker until a visibility deadline). Expired delays and leases are
//! promoted back to ready lazily, whenever the queue is touched.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, Priority};
use crate::job_queue::{Delivery, JobQueue, QueueEntry};

#[derive(Debug)]
enum SlotState {
    Ready { seq: u64 },
    Delayed { visible_at: Instant },
    Leased { worker_id: String, deadline: Instant },
}

#[derive(Debug)]
struct Slot {
    entry: QueueEntry,
    state: SlotState,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<Uuid, Slot>,
    ready: BTreeSet<(Reverse<Priority>, u64, Uuid)>,
    delayed: BTreeSet<(Instant, Uuid)>,
    leases: BTreeSet<(Instant, Uuid)>,
    next_seq: u64,
}

impl QueueState {
    /// Detach `job_id` from whichever index currently holds it.
    fn unindex(&mut self, job_id: Uuid) {
        let Some(slot) = self.slots.get(&job_id) else {
            return;
        };
        match &slot.state {
            SlotState::Ready { seq } => {
                self.ready
                    .remove(&(Reverse(slot.entry.priority), *seq, job_id));
            }
            SlotState::Delayed { visible_at } => {
                self.delayed.remove(&(*visible_at, job_id));
            }
            SlotState::Leased { deadline, .. } => {
                self.leases.remove(&(*deadline, job_id));
            }
        }
    }

    fn make_ready(&mut self, job_id: Uuid) {
        self.unindex(job_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(slot) = self.slots.get_mut(&job_id) {
            slot.state = SlotState::Ready { seq };
            self.ready.insert((Reverse(slot.entry.priority), seq, job_id));
        }
    }

    fn make_delayed(&mut self, job_id: Uuid, visible_at: Instant) {
        self.unindex(job_id);
        if let Some(slot) = self.slots.get_mut(&job_id) {
            slot.state = SlotState::Delayed { visible_at };
            self.delayed.insert((visible_at, job_id));
        }
    }

    /// Move elapsed delays and expired leases back to ready.
    fn promote(&mut self, now: Instant) {
        while let Some(&(visible_at, job_id)) = self.delayed.first() {
            if visible_at > now {
                break;
            }
            self.make_ready(job_id);
        }
        while let Some(&(deadline, job_id)) = self.leases.first() {
            if deadline > now {
                break;
            }
            tracing::warn!(%job_id, "Lease expired, job visible again");
            self.make_ready(job_id);
        }
    }

    fn lease_next(&mut self, worker_id: &str, deadline: Instant) -> Option<Delivery> {
        let &(_, _, job_id) = self.ready.first()?;
        self.unindex(job_id);
        let slot = self.slots.get_mut(&job_id)?;
        slot.state = SlotState::Leased {
            worker_id: worker_id.to_string(),
            deadline,
        };
        slot.delivery_count += 1;
        self.leases.insert((deadline, job_id));
        Some(Delivery {
            entry: slot.entry.clone(),
            worker_id: worker_id.to_string(),
            delivery_count: slot.delivery_count,
        })
    }

    fn is_leased(&self, job_id: Uuid) -> bool {
        matches!(
            self.slots.get(&job_id).map(|s| &s.state),
            Some(SlotState::Leased { .. })
        )
    }

    /// Whether `delivery` is the lease currently held on its entry.
    fn holds_lease(&self, delivery: &Delivery) -> bool {
        self.slots.get(&delivery.job_id()).is_some_and(|slot| {
            slot.delivery_count == delivery.delivery_count
                && matches!(
                    &slot.state,
                    SlotState::Leased { worker_id, .. } if *worker_id == delivery.worker_id
                )
        })
    }

    fn next_event(&self) -> Option<Instant> {
        let delayed = self.delayed.first().map(|(t, _)| *t);
        let lease = self.leases.first().map(|(t, _)| *t);
        match (delayed, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

/// Priority queue held in process memory. Not durable across restarts;
/// use the PostgreSQL queue for that.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    inner: Arc<Inner>,
}

impl InMemoryJobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                visibility_timeout,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned queue mutex");
            poisoned.into_inner()
        })
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<Uuid, AppError> {
        let entry = QueueEntry::for_job(job)?;
        let job_id = entry.job_id;
        {
            let mut state = self.lock_state();
            if state.slots.contains_key(&job_id) {
                return Ok(job_id);
            }
            state.slots.insert(
                job_id,
                Slot {
                    entry,
                    state: SlotState::Delayed {
                        visible_at: Instant::now(),
                    },
                    delivery_count: 0,
                },
            );
            state.make_ready(job_id);
        }
        self.inner.notify.notify_one();
        Ok(job_id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, AppError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.notify.notified();

            let next_event = {
                let mut state = self.lock_state();
                let now = Instant::now();
                state.promote(now);
                if let Some(delivery) =
                    state.lease_next(worker_id, now + self.inner.visibility_timeout)
                {
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Ok(Some(delivery));
                }
                state.next_event()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_event.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, AppError> {
        let job_id = delivery.job_id();
        let mut state = self.lock_state();
        if !state.holds_lease(delivery) {
            return Ok(false);
        }
        state.unindex(job_id);
        state.slots.remove(&job_id);
        Ok(true)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<bool, AppError> {
        let job_id = delivery.job_id();
        {
            let mut state = self.lock_state();
            if !state.holds_lease(delivery) {
                return Ok(false);
            }
            if !requeue {
                state.unindex(job_id);
                state.slots.remove(&job_id);
                return Ok(true);
            }
            state.make_ready(job_id);
        }
        self.inner.notify.notify_one();
        Ok(true)
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<bool, AppError> {
        let job_id = delivery.job_id();
        {
            let mut state = self.lock_state();
            if !state.holds_lease(delivery) {
                return Ok(false);
            }
            state.make_delayed(job_id, Instant::now() + delay);
        }
        // Sleeping dequeuers may need an earlier wake-up.
        self.inner.notify.notify_one();
        Ok(true)
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.lock_state();
        if !state.slots.contains_key(&job_id) || state.is_leased(job_id) {
            return Ok(false);
        }
        state.unindex(job_id);
        state.slots.remove(&job_id);
        Ok(true)
    }

    async fn depth(&self) -> Result<u64, AppError> {
        Ok(self.lock_state().slots.len() as u64)
    }

    async fn release_worker(&self, worker_id: &str) -> Result<u64, AppError> {
        let released = {
            let mut state = self.lock_state();
            let held: Vec<Uuid> = state
                .slots
                .iter()
                .filter(|(_, slot)| {
                    matches!(&slot.state, SlotState::Leased { worker_id: w, .. } if w == worker_id)
                })
                .map(|(id, _)| *id)
                .collect();
            for job_id in &held {
                state.make_ready(*job_id);
            }
            held.len() as u64
        };
        if released > 0 {
            self.inner.notify.notify_one();
        }
        Ok(released)
    }
}
