//! Settlement worker.
//!
//! One pass over the queue:
//!
//! ```text
//!   pop_ready(batch) ─► for each job:
//!       already settled here?        ──► complete, Skipped
//!       try_acquire settle:{key}
//!         Contended                  ──► complete, Skipped
//!         Acquired | Unguarded
//!           provider.capture ─► sign ─► sink.emit
//!             ok                     ──► complete, Settled
//!             err, attempts < max    ──► reschedule(now + backoff), Retrying
//!             err, attempts == max   ──► dead_letter, DeadLettered
//!       release lease (after the queue transition)
//! ```
//!
//! The lease is released only once the key is marked settled, so a
//! duplicate job that wins the lease next sees `AlreadySettled`.
//!
//! Several workers may share one queue and one lock manager. A job whose
//! lease is held elsewhere is dropped from this worker's batch rather than
//! retried: the holder is assumed to be making progress.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use visitpay_ingress::EventSigner;
use visitpay_store::{IdempotencyLockManager, LockGrant};
use visitpay_types::constants::{PAYMENT_CAPTURED, SETTLEMENT_LOCK_PREFIX};
use visitpay_types::{
    Clock, JobId, JobKind, JobPayload, Result, SettlementConfig, SettlementEvent, SettlementJob,
    SettlementPayload,
};

use crate::backoff::BackoffPolicy;
use crate::provider::SettlementProvider;
use crate::queue::SettlementQueue;
use crate::settled::{DEFAULT_SETTLED_CAPACITY, SettledKeys};
use crate::sink::EventSink;

/// Why a popped job was dropped without a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker holds the settlement lease.
    LeaseHeld,
    /// This process already settled the idempotency key.
    AlreadySettled,
}

/// What happened to one popped job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Settled {
        job_id: JobId,
        event: SettlementEvent,
    },
    Skipped {
        job_id: JobId,
        reason: SkipReason,
    },
    Retrying {
        job_id: JobId,
        attempts: u32,
        next_attempt_at_ms: u64,
        error: String,
    },
    DeadLettered {
        job_id: JobId,
        error: String,
    },
}

impl JobOutcome {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Settled { job_id, .. }
            | Self::Skipped { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::DeadLettered { job_id, .. } => *job_id,
        }
    }
}

/// Lease key guarding one idempotency key.
#[must_use]
pub fn settlement_lock_key(idempotency_key: &str) -> String {
    format!("{SETTLEMENT_LOCK_PREFIX}:{idempotency_key}")
}

/// Drains the settlement queue against a provider.
pub struct SettlementWorker {
    queue: Arc<SettlementQueue>,
    locks: IdempotencyLockManager,
    provider: Arc<dyn SettlementProvider>,
    sink: Arc<dyn EventSink>,
    signer: EventSigner,
    settled: Arc<SettledKeys>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    lock_ttl_ms: u64,
    batch_size: usize,
    poll_interval: Duration,
}

impl SettlementWorker {
    #[must_use]
    pub fn new(
        queue: Arc<SettlementQueue>,
        locks: IdempotencyLockManager,
        provider: Arc<dyn SettlementProvider>,
        sink: Arc<dyn EventSink>,
        signer: EventSigner,
        clock: Arc<dyn Clock>,
        config: &SettlementConfig,
    ) -> Self {
        Self {
            queue,
            locks,
            provider,
            sink,
            signer,
            settled: Arc::new(SettledKeys::new(DEFAULT_SETTLED_CAPACITY)),
            clock,
            backoff: BackoffPolicy::from_config(config),
            lock_ttl_ms: config.lock_ttl_ms,
            batch_size: config.batch_size,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Share a settled-key guard with other workers in this process.
    #[must_use]
    pub fn with_settled_keys(mut self, settled: Arc<SettledKeys>) -> Self {
        self.settled = settled;
        self
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<SettlementQueue> {
        &self.queue
    }

    /// Pop one batch of due jobs and process each in turn.
    pub async fn process_ready(&self) -> Vec<JobOutcome> {
        let jobs = self.queue.pop_ready(JobKind::Settlement, self.batch_size);
        if !jobs.is_empty() {
            debug!(count = jobs.len(), "processing settlement batch");
        }
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            outcomes.push(self.process_job(job).await);
        }
        outcomes
    }

    /// Run one popped job to its next state. The job must be in flight in
    /// this worker's queue.
    pub async fn process_job(&self, job: SettlementJob) -> JobOutcome {
        let payload = match &job.payload {
            JobPayload::Settlement(payload) => payload.clone(),
        };
        let key = payload.idempotency_key.as_str();

        if self.settled.is_settled(key) {
            debug!(job = %job.id, key, "already settled, dropping duplicate job");
            self.queue.complete(&job.id);
            return JobOutcome::Skipped {
                job_id: job.id,
                reason: SkipReason::AlreadySettled,
            };
        }

        let grant = self
            .locks
            .try_acquire(&settlement_lock_key(key), self.lock_ttl_ms)
            .await;
        if !grant.may_proceed() {
            debug!(job = %job.id, key, "settlement lease held elsewhere, skipping");
            self.queue.complete(&job.id);
            return JobOutcome::Skipped {
                job_id: job.id,
                reason: SkipReason::LeaseHeld,
            };
        }

        let outcome = match self.attempt(&payload).await {
            Ok(event) => self.on_success(job, event),
            Err(err) => self.on_failure(job, err.to_string()),
        };

        if let LockGrant::Acquired(lease) = &grant {
            self.locks.release(lease).await;
        }
        outcome
    }

    /// Provider call, event signing, and emission. Nothing here touches the
    /// queue or the lease.
    async fn attempt(&self, payload: &SettlementPayload) -> Result<SettlementEvent> {
        let capture = self.provider.capture(payload).await?;
        let mut event = SettlementEvent {
            provider: self.provider.name().to_string(),
            event_type: PAYMENT_CAPTURED.to_string(),
            mission_id: payload.mission_id.clone(),
            external_payment_id: capture.external_payment_id,
            amount: payload.amount,
            currency: payload.currency.clone(),
            ts: self.clock.now_ms(),
            signature: String::new(),
        };
        self.signer.sign(&mut event);
        self.sink.emit(&event).await?;
        Ok(event)
    }

    fn on_success(&self, job: SettlementJob, event: SettlementEvent) -> JobOutcome {
        let key = job.payload.idempotency_key();
        if let Err(err) = self.settled.mark_settled(key) {
            debug!(job = %job.id, error = %err, "settled-key guard already had key");
        }
        self.queue.complete(&job.id);
        info!(
            job = %job.id,
            key,
            payment = %event.external_payment_id,
            amount = %event.amount,
            currency = %event.currency,
            attempts = job.attempts + 1,
            "settlement captured"
        );
        JobOutcome::Settled {
            job_id: job.id,
            event,
        }
    }

    fn on_failure(&self, mut job: SettlementJob, error: String) -> JobOutcome {
        job.attempts = job.attempts.saturating_add(1);
        job.last_error = Some(error.clone());
        let job_id = job.id;

        if job.has_attempts_left() {
            let next_attempt_at_ms = self
                .clock
                .now_ms()
                .saturating_add(self.backoff.delay_ms(job.attempts));
            let attempts = job.attempts;
            warn!(
                job = %job_id,
                attempts,
                max_attempts = job.max_attempts,
                next_attempt_at_ms,
                error = %error,
                "settlement attempt failed, retrying"
            );
            self.queue.reschedule(job, next_attempt_at_ms);
            JobOutcome::Retrying {
                job_id,
                attempts,
                next_attempt_at_ms,
                error,
            }
        } else {
            self.queue.dead_letter(job, error.clone());
            JobOutcome::DeadLettered { job_id, error }
        }
    }

    /// Poll the queue until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis(),
            provider = self.provider.name(),
            "settlement worker started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.process_ready().await;
                }
            }
        }
        info!("settlement worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ScriptedOutcome, SimulatedProvider};
    use crate::sink::RecordingSink;
    use visitpay_store::{MemoryStore, OfflineStore, SharedStore};
    use visitpay_types::{DrainOrder, JobState, ManualClock};

    struct Harness {
        clock: Arc<ManualClock>,
        queue: Arc<SettlementQueue>,
        locks: IdempotencyLockManager,
        provider: Arc<SimulatedProvider>,
        sink: Arc<RecordingSink>,
        signer: EventSigner,
        worker: SettlementWorker,
    }

    fn harness_with(store: Arc<dyn SharedStore>, max_attempts: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let queue = Arc::new(SettlementQueue::new(clock.clone(), DrainOrder::Fifo));
        let locks = IdempotencyLockManager::new(store, clock.clone());
        let provider = Arc::new(SimulatedProvider::new("simulated"));
        let sink = Arc::new(RecordingSink::new());
        let signer = EventSigner::new("event-secret", "visitpay:settlement:v1").unwrap();
        let config = SettlementConfig {
            max_attempts,
            ..SettlementConfig::default()
        };
        let worker = SettlementWorker::new(
            queue.clone(),
            locks.clone(),
            provider.clone(),
            sink.clone(),
            signer.clone(),
            clock.clone(),
            &config,
        );
        Harness {
            clock,
            queue,
            locks,
            provider,
            sink,
            signer,
            worker,
        }
    }

    fn harness(max_attempts: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        harness_with(Arc::new(MemoryStore::new(clock)), max_attempts)
    }

    fn enqueue(h: &Harness, mission: &str, max_attempts: u32) -> JobId {
        h.queue
            .enqueue_settlement(SettlementPayload::dummy(mission), max_attempts)
            .unwrap()
    }

    #[tokio::test]
    async fn success_emits_signed_event_and_releases_lease() {
        let h = harness(5);
        let id = enqueue(&h, "m1", 5);

        let outcomes = h.worker.process_ready().await;
        let [JobOutcome::Settled { job_id, event }] = outcomes.as_slice() else {
            panic!("expected one settled job, got {outcomes:?}");
        };
        assert_eq!(*job_id, id);
        assert_eq!(event.event_type, "payment.captured");
        assert_eq!(event.provider, "simulated");
        assert_eq!(event.ts, h.clock.now_ms());
        assert!(h.signer.verify(event));
        assert_eq!(h.sink.events(), vec![event.clone()]);
        assert_eq!(h.queue.state_of(&id), None);

        assert!(
            h.locks
                .try_lock(&settlement_lock_key("user-1:gangnam:m1"), 1_000)
                .await,
            "lease must be released after success"
        );
    }

    #[tokio::test]
    async fn failure_backs_off_then_succeeds() {
        let h = harness(5);
        h.provider.script([ScriptedOutcome::Fail("timeout".into())]);
        let id = enqueue(&h, "m1", 5);

        let outcomes = h.worker.process_ready().await;
        let [JobOutcome::Retrying { attempts, next_attempt_at_ms, error, .. }] = outcomes.as_slice()
        else {
            panic!("expected retry, got {outcomes:?}");
        };
        assert_eq!(*attempts, 1);
        assert_eq!(*next_attempt_at_ms, h.clock.now_ms() + 2_000);
        assert!(error.contains("timeout"));
        assert_eq!(h.queue.state_of(&id), Some(JobState::Retrying));

        h.clock.advance(1_999);
        assert!(h.worker.process_ready().await.is_empty());
        h.clock.advance(1);
        let outcomes = h.worker.process_ready().await;
        assert!(matches!(outcomes.as_slice(), [JobOutcome::Settled { .. }]));
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn exhaustion_dead_letters_with_last_error() {
        let h = harness(2);
        h.provider.script([
            ScriptedOutcome::Fail("first".into()),
            ScriptedOutcome::Fail("second".into()),
        ]);
        let id = enqueue(&h, "m1", 2);

        h.worker.process_ready().await;
        h.clock.advance(60_000);
        let outcomes = h.worker.process_ready().await;
        let [JobOutcome::DeadLettered { job_id, error }] = outcomes.as_slice() else {
            panic!("expected dead letter, got {outcomes:?}");
        };
        assert_eq!(*job_id, id);
        assert!(error.contains("second"));

        let dlq = h.queue.list_dlq(10);
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].job.attempts, 2);
        assert!(h.sink.is_empty());
    }

    #[tokio::test]
    async fn held_lease_skips_job() {
        let h = harness(5);
        let id = enqueue(&h, "m1", 5);
        assert!(
            h.locks
                .try_lock(&settlement_lock_key("user-1:gangnam:m1"), 60_000)
                .await
        );

        let outcomes = h.worker.process_ready().await;
        assert_eq!(
            outcomes,
            vec![JobOutcome::Skipped {
                job_id: id,
                reason: SkipReason::LeaseHeld
            }]
        );
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(h.queue.state_of(&id), None, "skipped jobs leave the queue");
    }

    #[tokio::test]
    async fn duplicate_job_for_settled_key_skipped() {
        let h = harness(5);
        enqueue(&h, "m1", 5);
        h.worker.process_ready().await;
        enqueue(&h, "m1", 5);
        let outcomes = h.worker.process_ready().await;
        assert!(matches!(
            outcomes.as_slice(),
            [JobOutcome::Skipped {
                reason: SkipReason::AlreadySettled,
                ..
            }]
        ));
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn lease_released_after_failure() {
        let h = harness(5);
        h.provider.script([ScriptedOutcome::Fail("boom".into())]);
        enqueue(&h, "m1", 5);
        h.worker.process_ready().await;
        assert!(
            h.locks
                .try_lock(&settlement_lock_key("user-1:gangnam:m1"), 1_000)
                .await
        );
    }

    #[tokio::test]
    async fn store_outage_settles_unguarded() {
        let h = harness_with(Arc::new(OfflineStore), 5);
        enqueue(&h, "m1", 5);
        let outcomes = h.worker.process_ready().await;
        assert!(matches!(outcomes.as_slice(), [JobOutcome::Settled { .. }]));
    }

    #[tokio::test]
    async fn one_failing_job_does_not_block_others() {
        let h = harness(1);
        h.provider.script([ScriptedOutcome::Fail("declined".into())]);
        enqueue(&h, "bad", 1);
        enqueue(&h, "good", 1);
        let outcomes = h.worker.process_ready().await;
        assert!(matches!(outcomes[0], JobOutcome::DeadLettered { .. }));
        assert!(matches!(outcomes[1], JobOutcome::Settled { .. }));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(5);
        enqueue(&h, "m1", 5);
        let worker = Arc::new(h.worker);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        for _ in 0..100 {
            if !h.sink.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(h.sink.len(), 1);
    }

    /// Records, at each lease release, whether the key was already marked
    /// settled.
    struct ReleaseObserver {
        inner: MemoryStore,
        settled: Arc<SettledKeys>,
        settled_at_release: parking_lot::Mutex<Vec<bool>>,
    }

    #[async_trait::async_trait]
    impl SharedStore for ReleaseObserver {
        async fn incr(&self, key: &str, ttl: Duration) -> Result<visitpay_store::CounterState> {
            self.inner.incr(key, ttl).await
        }

        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
            self.inner.set_nx(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
            let idempotency_key = key
                .strip_prefix(&settlement_lock_key(""))
                .unwrap_or(key);
            self.settled_at_release
                .lock()
                .push(self.settled.is_settled(idempotency_key));
            self.inner.compare_and_delete(key, expected).await
        }
    }

    #[tokio::test]
    async fn lease_outlives_settled_marking() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let settled = Arc::new(SettledKeys::new(16));
        let store = Arc::new(ReleaseObserver {
            inner: MemoryStore::new(clock.clone()),
            settled: settled.clone(),
            settled_at_release: parking_lot::Mutex::new(Vec::new()),
        });
        let h = harness_with(store.clone(), 5);
        let worker = h.worker.with_settled_keys(settled.clone());

        h.queue
            .enqueue_settlement(SettlementPayload::dummy("m1"), 5)
            .unwrap();
        let outcomes = worker.process_ready().await;
        assert!(matches!(outcomes.as_slice(), [JobOutcome::Settled { .. }]));
        assert_eq!(*store.settled_at_release.lock(), vec![true]);

        // A duplicate that now wins the free lease is dropped before capture.
        h.queue
            .enqueue_settlement(SettlementPayload::dummy("m1"), 5)
            .unwrap();
        let outcomes = worker.process_ready().await;
        assert!(matches!(
            outcomes.as_slice(),
            [JobOutcome::Skipped {
                reason: SkipReason::AlreadySettled,
                ..
            }]
        ));
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn sink_failure_retries_without_double_capture() {
        let h = harness(5);
        h.sink.reject(["event bus down".to_string()]);
        let id = enqueue(&h, "m1", 5);

        let outcomes = h.worker.process_ready().await;
        let [JobOutcome::Retrying { attempts, error, .. }] = outcomes.as_slice() else {
            panic!("expected retry, got {outcomes:?}");
        };
        assert_eq!(*attempts, 1);
        assert!(error.starts_with("VP_ERR_503"), "{error}");
        assert_eq!(h.queue.state_of(&id), Some(JobState::Retrying));

        h.clock.advance(2_000);
        let outcomes = h.worker.process_ready().await;
        assert!(matches!(outcomes.as_slice(), [JobOutcome::Settled { .. }]));
        assert_eq!(h.provider.calls(), 2);
        assert_eq!(h.provider.captured(), 1);
        assert_eq!(h.sink.len(), 1);
    }

    #[test]
    fn lock_key_format() {
        assert_eq!(settlement_lock_key("u:p:m"), "settle:u:p:m");
    }
}
