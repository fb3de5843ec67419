//! End-to-end integration tests across the verification and settlement
//! planes.
//!
//! These tests drive the whole path a reward takes:
//! proof token -> scan consensus -> geofence -> eligibility -> settlement
//! queue -> provider -> signed `payment.captured` event.

use std::sync::Arc;

use rust_decimal::Decimal;
use visitpay_ingress::{
    ConsensusValidator, EventSigner, InMemoryVerificationStore, Signer, VerificationAggregator,
    VerificationReport, VerificationService,
};
use visitpay_settlement::{
    JobOutcome, RecordingSink, ScriptedOutcome, SettlementQueue, SettlementWorker,
    SimulatedProvider, backoff_ms,
};
use visitpay_store::{IdempotencyLockManager, MemoryStore, RateLimiter};
use visitpay_types::*;

const CALLER: &str = "192.0.2.10";

/// Helper: one node's worth of wired components over a manual clock.
struct Pipeline {
    clock: Arc<ManualClock>,
    service: VerificationService,
    queue: Arc<SettlementQueue>,
    provider: Arc<SimulatedProvider>,
    sink: Arc<RecordingSink>,
    event_signer: EventSigner,
    worker: SettlementWorker,
    fence: Geofence,
}

impl Pipeline {
    fn new(max_attempts: u32) -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));

        let signer =
            Signer::new(b"proof-secret", "visitpay:proof:v1", 300_000, clock.clone()).unwrap();
        let consensus = ConsensusValidator::new(ConsensusConfig {
            adaptive: false,
            ..ConsensusConfig::default()
        });
        let aggregator = VerificationAggregator::new(
            Arc::new(InMemoryVerificationStore::new()),
            EligibilityPolicy::default(),
            clock.clone(),
        );
        let service = VerificationService::new(
            signer,
            consensus,
            aggregator,
            RateLimiter::new(store.clone()),
            RateLimitConfig::default(),
            clock.clone(),
        );

        let settlement = SettlementConfig {
            max_attempts,
            ..SettlementConfig::default()
        };
        let queue = Arc::new(SettlementQueue::new(clock.clone(), settlement.drain_order));
        let provider = Arc::new(SimulatedProvider::new("simulated"));
        let sink = Arc::new(RecordingSink::new());
        let event_signer = EventSigner::new("event-secret", "visitpay:settlement:v1").unwrap();
        let worker = SettlementWorker::new(
            queue.clone(),
            IdempotencyLockManager::new(store, clock.clone()),
            provider.clone(),
            sink.clone(),
            event_signer.clone(),
            clock.clone(),
            &settlement,
        );

        Self {
            clock,
            service,
            queue,
            provider,
            sink,
            event_signer,
            worker,
            fence: Geofence {
                center: GeoPoint::new(37.4979, 127.0276),
                radius_meters: 80.0,
                max_accuracy_meters: 50.0,
            },
        }
    }

    /// Scan `raw` on `frames` consecutive frames, 40 ms apart.
    async fn scan(&self, user: &UserId, place: &PlaceId, raw: &str, frames: u64) -> VerificationReport {
        let start = self.clock.now_ms();
        let mut last = None;
        for i in 0..frames {
            let read = ScanRead::new(raw, start + i * 40, "cam0");
            last = Some(
                self.service
                    .submit_scan(CALLER, user, place, read)
                    .await
                    .unwrap(),
            );
        }
        self.clock.advance(frames * 40);
        last.unwrap()
    }

    async fn locate(&self, user: &UserId, place: &PlaceId, lat: f64, lng: f64) -> VerificationReport {
        let sample = LocationSample::new(lat, lng, 12.0);
        self.service
            .submit_location(CALLER, user, place, &sample, &self.fence)
            .await
            .unwrap()
    }

    fn enqueue_reward(&self, user: &UserId, place: &PlaceId, mission: &MissionId) -> JobId {
        let payload = SettlementPayload::new(
            user.clone(),
            place,
            mission.clone(),
            Decimal::new(1000, 0),
            "KRW",
        )
        .unwrap();
        self.queue.enqueue_settlement(payload, 3).unwrap()
    }
}

#[tokio::test]
async fn gangnam_mission_settles_once() {
    let p = Pipeline::new(3);
    let user = UserId::new("user-1");
    let place = PlaceId::new("gangnam");

    // GPS first: far away is rejected, 50 m from the center of an 80 m fence
    // passes. GPS alone is not enough.
    let far = p.locate(&user, &place, 37.5665, 126.9780).await;
    assert!(!far.passed);
    assert!(far.geofence.unwrap().distance_meters > 5_000.0);

    let near = p.locate(&user, &place, 37.49835, 127.0276).await;
    assert!(near.passed, "{near:?}");
    let distance = near.geofence.unwrap().distance_meters;
    assert!((45.0..=55.0).contains(&distance), "distance {distance}");
    assert!(!near.newly_allowed);
    assert!(near.eligibility.gps_ok);
    assert!(!near.eligibility.allowed);

    let token = p
        .service
        .issue_token(CALLER, place.clone(), MissionId::new("m1"))
        .await
        .unwrap();
    let raw = token.encode();

    // Two frames are not enough.
    let pending = p.scan(&user, &place, &raw, 2).await;
    assert!(!pending.passed);

    // The third agreeing frame, still inside 1000 ms, records QR and makes
    // the visit eligible.
    let scanned = p.scan(&user, &place, &raw, 1).await;
    assert!(scanned.passed, "{scanned:?}");
    let consensus = scanned.consensus.unwrap();
    assert!(consensus.valid);
    assert_eq!(consensus.consecutive_matches, 3);
    let mission = scanned.mission_id.clone().unwrap();
    assert_eq!(mission, MissionId::new("m1"));
    assert!(scanned.newly_allowed);

    let eligibility = p
        .service
        .aggregator()
        .get_eligibility(&user, &place)
        .await
        .unwrap();
    assert!(eligibility.allowed && eligibility.gps_ok && eligibility.qr_ok);

    let job_id = p.enqueue_reward(&user, &place, &mission);

    // A late receipt does not fire the edge again.
    let receipt = p
        .service
        .submit_receipt(CALLER, &user, &place, true)
        .await
        .unwrap();
    assert!(receipt.eligibility.allowed);
    assert!(!receipt.newly_allowed);

    let outcomes = p.worker.process_ready().await;
    let [JobOutcome::Settled { job_id: settled, event }] = outcomes.as_slice() else {
        panic!("expected settlement, got {outcomes:?}");
    };
    assert_eq!(*settled, job_id);
    assert_eq!(event.event_type, constants::PAYMENT_CAPTURED);
    assert_eq!(event.mission_id, mission);
    assert_eq!(event.amount, Decimal::new(1000, 0));
    assert_eq!(event.currency, "KRW");
    assert!(p.event_signer.verify(event));

    let mut forged = event.clone();
    forged.amount = Decimal::new(1_000_000, 0);
    assert!(!p.event_signer.verify(&forged));

    assert_eq!(p.sink.len(), 1);
    assert_eq!(p.provider.captured(), 1);
    assert!(p.worker.process_ready().await.is_empty());
    assert_eq!(p.queue.state_of(&job_id), None);
    assert_eq!(p.queue.stats(), visitpay_settlement::QueueStats::default());
}

#[tokio::test]
async fn dead_letter_recovery() {
    let p = Pipeline::new(3);
    p.provider.script(
        (1..=3).map(|i| ScriptedOutcome::Fail(format!("provider unavailable #{i}"))),
    );
    let job_id = p.enqueue_reward(
        &UserId::new("user-2"),
        &PlaceId::new("gangnam"),
        &MissionId::new("m1"),
    );

    // Attempt 1 and 2 back off; attempt 3 exhausts the budget.
    for attempt in 1..=3u32 {
        let outcomes = p.worker.process_ready().await;
        assert_eq!(outcomes.len(), 1, "attempt {attempt}");
        match &outcomes[0] {
            JobOutcome::Retrying {
                attempts,
                next_attempt_at_ms,
                ..
            } => {
                assert_eq!(*attempts, attempt);
                assert_eq!(
                    *next_attempt_at_ms,
                    p.clock.now_ms() + backoff_ms(attempt, 1_000, 60_000)
                );
                p.clock.set(*next_attempt_at_ms);
            }
            JobOutcome::DeadLettered { job_id: dead, error } => {
                assert_eq!(attempt, 3);
                assert_eq!(*dead, job_id);
                assert_eq!(error, "VP_ERR_500: Provider failure: provider unavailable #3");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    let dlq = p.queue.list_dlq(10);
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].job.id, job_id);
    assert_eq!(dlq[0].job.attempts, 3);
    assert!(dlq[0].error.contains("provider unavailable #3"));
    assert!(p.worker.process_ready().await.is_empty());

    // Operator requeues; the job is immediately poppable with a fresh budget.
    p.queue.requeue_from_dlq(0).unwrap();
    let popped = p.queue.pop_ready(JobKind::Settlement, 10);
    assert_eq!(popped.len(), 1);
    assert_eq!(popped[0].attempts, 0);
    assert!(popped[0].is_due(p.clock.now_ms()));

    let outcome = p.worker.process_job(popped.into_iter().next().unwrap()).await;
    assert!(matches!(outcome, JobOutcome::Settled { .. }));
    assert!(p.queue.list_dlq(10).is_empty());
    assert_eq!(p.provider.calls(), 4);
}

#[test]
fn backoff_bound_for_first_attempts() {
    let mut prev = 0;
    for attempts in 0..=6u32 {
        let d = backoff_ms(attempts, 1_000, 60_000);
        assert_eq!(d, (2u64.pow(attempts) * 1_000).min(60_000));
        assert!(d >= prev);
        assert!(d <= 60_000);
        prev = d;
    }
}

#[tokio::test]
async fn concurrent_workers_settle_each_job_once() {
    let p = Pipeline::new(3);
    for i in 0..20 {
        p.enqueue_reward(
            &UserId::new(format!("user-{i}")),
            &PlaceId::new("gangnam"),
            &MissionId::new("m1"),
        );
    }

    let worker = Arc::new(p.worker);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let worker = worker.clone();
        handles.push(tokio::spawn(async move {
            let mut settled = 0;
            loop {
                let outcomes = worker.process_ready().await;
                if outcomes.is_empty() {
                    break settled;
                }
                settled += outcomes
                    .iter()
                    .filter(|o| matches!(o, JobOutcome::Settled { .. }))
                    .count();
            }
        }));
    }
    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    assert_eq!(total, 20);
    assert_eq!(p.sink.len(), 20);
    assert_eq!(p.provider.captured(), 20);
}
