//! One visit, end to end, against in-process components.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use visitpay_ingress::{
    ConsensusValidator, EventSigner, InMemoryVerificationStore, Signer, VerificationAggregator,
    VerificationService,
};
use visitpay_settlement::{
    RecordingSink, ScriptedOutcome, SettlementQueue, SettlementWorker, SimulatedProvider,
};
use visitpay_store::{IdempotencyLockManager, MemoryStore, RateLimiter};
use visitpay_types::{
    Clock, GeoPoint, Geofence, LocationSample, MissionId, PlaceId, ScanRead, SettlementPayload,
    SystemClock, UserId, VisitpayConfig,
};

use crate::cli::DemoArgs;

const DEMO_CALLER: &str = "127.0.0.1";
const DEMO_ACCURACY_METERS: f64 = 10.0;
const DEMO_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn run(config: VisitpayConfig, args: DemoArgs) -> anyhow::Result<()> {
    config.validate().context("configuration rejected")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));

    let service = VerificationService::new(
        Signer::from_config(&config.signing, clock.clone())?,
        ConsensusValidator::new(config.consensus.clone()),
        VerificationAggregator::new(
            Arc::new(InMemoryVerificationStore::new()),
            config.eligibility,
            clock.clone(),
        ),
        RateLimiter::new(store.clone()),
        config.rate_limit.clone(),
        clock.clone(),
    );

    let user = UserId::new(args.user);
    let place = PlaceId::new(args.place);
    let fence = Geofence {
        center: GeoPoint::new(37.4979, 127.0276),
        radius_meters: args.radius,
        max_accuracy_meters: 50.0,
    };

    // Scanner: the printed token seen on enough consecutive frames.
    let token = service
        .issue_token(DEMO_CALLER, place.clone(), MissionId::new(args.mission))
        .await?;
    let raw = token.encode();
    info!(token = %raw, "token issued");

    let mut scan = None;
    for frame in 0..max_scan_frames(&config) {
        let read = ScanRead::new(raw.as_str(), clock.now_ms() + frame * 33, "demo-cam");
        let report = service.submit_scan(DEMO_CALLER, &user, &place, read).await?;
        let done = report.passed || report.failure.as_ref().is_some_and(|f| !is_pending(f));
        scan = Some(report);
        if done {
            break;
        }
    }
    let scan = scan.context("no scan frames submitted")?;
    println!("scan:     passed={} failure={:?}", scan.passed, scan.failure);
    let mission = scan
        .mission_id
        .clone()
        .context("scan did not yield a verified mission")?;

    let sample = LocationSample::new(args.lat, args.lng, DEMO_ACCURACY_METERS);
    let located = service
        .submit_location(DEMO_CALLER, &user, &place, &sample, &fence)
        .await?;
    println!(
        "location: passed={} distance={:.1}m failure={:?}",
        located.passed,
        located.geofence.as_ref().map_or(f64::NAN, |g| g.distance_meters),
        located.failure
    );

    let eligibility = service.aggregator().get_eligibility(&user, &place).await?;
    println!(
        "eligible: allowed={} gps={} qr={} receipt={}",
        eligibility.allowed, eligibility.gps_ok, eligibility.qr_ok, eligibility.receipt_ok
    );
    if !(scan.newly_allowed || located.newly_allowed) {
        warn!("visit not eligible, nothing to settle");
        return Ok(());
    }

    // Settlement.
    let queue = Arc::new(SettlementQueue::new(
        clock.clone(),
        config.settlement.drain_order,
    ));
    let provider = Arc::new(SimulatedProvider::new(config.settlement.provider.clone()));
    provider.script(
        (1..=args.provider_failures).map(|i| ScriptedOutcome::Fail(format!("simulated outage {i}"))),
    );
    let sink = Arc::new(RecordingSink::new());
    let worker = Arc::new(SettlementWorker::new(
        queue.clone(),
        IdempotencyLockManager::new(store, clock.clone()),
        provider,
        sink.clone(),
        EventSigner::from_config(&config.signing)?,
        clock.clone(),
        &config.settlement,
    ));

    let payload = SettlementPayload::new(user, &place, mission, args.amount, args.currency)?;
    let job_id = queue.enqueue_settlement(payload, config.settlement.max_attempts)?;
    info!(job = %job_id, "settlement enqueued");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    let deadline = tokio::time::Instant::now() + DEMO_TIMEOUT;
    loop {
        let stats = queue.stats();
        if stats.due + stats.waiting + stats.in_flight == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(?stats, "demo timed out with jobs outstanding");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let _ = shutdown_tx.send(true);
    handle.await.context("settlement worker panicked")?;

    for event in sink.events() {
        println!("event:    {}", serde_json::to_string(&event)?);
    }
    for dead in queue.list_dlq(10) {
        println!("dlq:      job={} error={}", dead.job.id, dead.error);
    }
    Ok(())
}

/// Enough frames to satisfy the strictest adaptive threshold.
fn max_scan_frames(config: &VisitpayConfig) -> u64 {
    u64::from(config.consensus.threshold) + 2
}

fn is_pending(failure: &visitpay_ingress::VerificationFailure) -> bool {
    matches!(
        failure,
        visitpay_ingress::VerificationFailure::ConsensusPending { .. }
    )
}
