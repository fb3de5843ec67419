//! In-process settlement queue.
//!
//! Holds three sets of jobs:
//!
//! ```text
//!   ready     ordered by insertion; a job is poppable once due
//!   in_flight popped, awaiting complete / reschedule / dead_letter
//!   dlq       exhausted jobs, newest last, until requeued or purged
//! ```
//!
//! "Due" is queried against the injected clock on every pop, so nothing
//! fires on a timer and tests never wait on wall-clock time.
//!
//! All state sits behind one mutex and every operation is a single critical
//! section, so concurrent workers never pop the same job.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use visitpay_types::{
    Clock, DeadLetter, DrainOrder, JobId, JobKind, JobState, Result, SettlementJob,
    SettlementPayload, VisitpayError,
};

/// Counts per set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// In the ready set and due now.
    pub due: usize,
    /// In the ready set but waiting out a backoff.
    pub waiting: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// Serializable image of the queue, each set as an ordered list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub ready: Vec<SettlementJob>,
    pub dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: Vec<SettlementJob>,
    in_flight: HashMap<JobId, SettlementJob>,
    dlq: Vec<DeadLetter>,
}

impl QueueState {
    fn contains(&self, id: &JobId) -> bool {
        self.in_flight.contains_key(id)
            || self.ready.iter().any(|j| j.id == *id)
            || self.dlq.iter().any(|d| d.job.id == *id)
    }
}

/// Ready / in-flight / dead-letter sets for settlement jobs.
pub struct SettlementQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    order: DrainOrder,
}

impl SettlementQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, order: DrainOrder) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            order,
        }
    }

    /// Add a job, due immediately with a fresh retry budget.
    pub fn enqueue(&self, mut job: SettlementJob) -> Result<JobId> {
        let mut state = self.state.lock();
        if state.contains(&job.id) {
            return Err(VisitpayError::DuplicateJob(job.id));
        }
        job.attempts = 0;
        job.next_attempt_at_ms = self.clock.now_ms();
        job.last_error = None;
        let id = job.id;
        debug!(job = %id, key = job.payload.idempotency_key(), "job enqueued");
        state.ready.push(job);
        Ok(id)
    }

    /// Wrap a payload in a new job and enqueue it.
    pub fn enqueue_settlement(&self, payload: SettlementPayload, max_attempts: u32) -> Result<JobId> {
        self.enqueue(SettlementJob::settlement(payload, max_attempts))
    }

    /// Remove up to `limit` due jobs of `kind` and mark them in flight.
    pub fn pop_ready(&self, kind: JobKind, limit: usize) -> Vec<SettlementJob> {
        if limit == 0 {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let eligible = |j: &SettlementJob| j.kind() == kind && j.is_due(now);
        let ready = &mut state.ready;
        let mut jobs = Vec::new();
        match self.order {
            DrainOrder::Fifo => {
                let mut i = 0;
                while i < ready.len() && jobs.len() < limit {
                    if eligible(&ready[i]) {
                        jobs.push(ready.remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            DrainOrder::Lifo => {
                let mut i = ready.len();
                while i > 0 && jobs.len() < limit {
                    i -= 1;
                    if eligible(&ready[i]) {
                        jobs.push(ready.remove(i));
                    }
                }
            }
        }

        for job in &jobs {
            state.in_flight.insert(job.id, job.clone());
        }
        jobs
    }

    /// Drop an in-flight job that settled or was skipped.
    pub fn complete(&self, id: &JobId) -> bool {
        self.state.lock().in_flight.remove(id).is_some()
    }

    /// Put a failed job back with a later due time.
    pub fn reschedule(&self, mut job: SettlementJob, next_attempt_at_ms: u64) {
        let mut state = self.state.lock();
        state.in_flight.remove(&job.id);
        job.next_attempt_at_ms = next_attempt_at_ms;
        debug!(
            job = %job.id,
            attempts = job.attempts,
            next_attempt_at_ms,
            "job rescheduled"
        );
        state.ready.push(job);
    }

    /// Park a job whose retry budget is spent.
    pub fn dead_letter(&self, job: SettlementJob, error: impl Into<String>) {
        let error = error.into();
        let mut state = self.state.lock();
        state.in_flight.remove(&job.id);
        warn!(
            job = %job.id,
            key = job.payload.idempotency_key(),
            attempts = job.attempts,
            error = %error,
            "job dead-lettered"
        );
        state.dlq.push(DeadLetter {
            job,
            error,
            dead_lettered_at_ms: self.clock.now_ms(),
        });
    }

    /// Up to `n` dead letters, most recent first.
    pub fn list_dlq(&self, n: usize) -> Vec<DeadLetter> {
        self.list_dlq_page(0, n)
    }

    /// A page of dead letters, most recent first. Index `0` is the newest.
    pub fn list_dlq_page(&self, offset: usize, n: usize) -> Vec<DeadLetter> {
        self.state
            .lock()
            .dlq
            .iter()
            .rev()
            .skip(offset)
            .take(n)
            .cloned()
            .collect()
    }

    /// Move a dead letter back to the ready set with a fresh budget.
    /// `index` counts from the newest, matching [`list_dlq`](Self::list_dlq).
    pub fn requeue_from_dlq(&self, index: usize) -> Result<JobId> {
        let mut state = self.state.lock();
        let len = state.dlq.len();
        if index >= len {
            return Err(VisitpayError::DeadLetterNotFound { index, len });
        }
        let mut job = state.dlq.remove(len - 1 - index).job;
        job.attempts = 0;
        job.next_attempt_at_ms = self.clock.now_ms();
        job.last_error = None;
        let id = job.id;
        info!(job = %id, key = job.payload.idempotency_key(), "job requeued from dead letters");
        state.ready.push(job);
        Ok(id)
    }

    /// Drop every dead letter. Returns how many were removed.
    pub fn purge_dlq(&self) -> usize {
        let purged = std::mem::take(&mut self.state.lock().dlq).len();
        if purged > 0 {
            info!(purged, "dead letters purged");
        }
        purged
    }

    /// Where a job currently sits. `None` once it has settled.
    pub fn state_of(&self, id: &JobId) -> Option<JobState> {
        let state = self.state.lock();
        if state.in_flight.contains_key(id) {
            return Some(JobState::InFlight);
        }
        if let Some(job) = state.ready.iter().find(|j| j.id == *id) {
            return Some(if job.attempts == 0 {
                JobState::Ready
            } else {
                JobState::Retrying
            });
        }
        state
            .dlq
            .iter()
            .any(|d| d.job.id == *id)
            .then_some(JobState::DeadLettered)
    }

    pub fn stats(&self) -> QueueStats {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        let due = state.ready.iter().filter(|j| j.is_due(now)).count();
        QueueStats {
            due,
            waiting: state.ready.len() - due,
            in_flight: state.in_flight.len(),
            dead_lettered: state.dlq.len(),
        }
    }

    /// Ready and dead-lettered jobs in order. In-flight jobs are included in
    /// the ready list so a restore retries them.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let mut ready = state.ready.clone();
        ready.extend(state.in_flight.values().cloned());
        QueueSnapshot {
            ready,
            dead_letters: state.dlq.clone(),
        }
    }

    /// Replace the queue contents with a snapshot.
    pub fn restore(&self, snapshot: QueueSnapshot) {
        let mut state = self.state.lock();
        state.ready = snapshot.ready;
        state.in_flight.clear();
        state.dlq = snapshot.dead_letters;
    }
}
