//! Verification aggregator.
//!
//! Merges per-factor evidence into one record per `(user, place)` and derives
//! eligibility:
//!
//! ```text
//!   allowed = gps_ok && (qr_ok || receipt_ok)          default policy
//!   allowed = gps_ok && qr_ok && receipt_ok            receipt_required
//! ```
//!
//! Each call updates only the flag it carries evidence for. The upsert is
//! atomic per key, so concurrent updates for different factors never lose
//! each other's writes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use visitpay_types::{
    Clock, Eligibility, EligibilityPolicy, PlaceId, Result, UserId, VerificationFlag,
    VerificationRecord,
};

/// Record state on both sides of one upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagUpdate {
    /// `None` if the record did not exist before this call.
    pub before: Option<VerificationRecord>,
    pub after: VerificationRecord,
}

/// Persistence for verification records.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Create the record if missing, then merge one flag, atomically.
    /// `at` stamps the record's `updated_at`.
    async fn upsert_flag(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        flag: VerificationFlag,
        ok: bool,
        at: DateTime<Utc>,
    ) -> Result<FlagUpdate>;

    async fn get(&self, user_id: &UserId, place_id: &PlaceId)
    -> Result<Option<VerificationRecord>>;
}

/// In-process verification store.
#[derive(Debug, Default)]
pub struct InMemoryVerificationStore {
    records: DashMap<(UserId, PlaceId), VerificationRecord>,
}

impl InMemoryVerificationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl VerificationStore for InMemoryVerificationStore {
    async fn upsert_flag(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        flag: VerificationFlag,
        ok: bool,
        at: DateTime<Utc>,
    ) -> Result<FlagUpdate> {
        let key = (user_id.clone(), place_id.clone());
        let mut before = None;
        let mut entry = self
            .records
            .entry(key)
            .and_modify(|r| before = Some(r.clone()))
            .or_insert_with(|| VerificationRecord::new(user_id.clone(), place_id.clone(), at));
        entry.merge(flag, ok, at);
        Ok(FlagUpdate {
            before,
            after: entry.clone(),
        })
    }

    async fn get(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
    ) -> Result<Option<VerificationRecord>> {
        Ok(self
            .records
            .get(&(user_id.clone(), place_id.clone()))
            .map(|r| r.clone()))
    }
}

/// Eligibility after a flag update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub eligibility: Eligibility,
    /// `true` exactly once per `(user, place)`: on the update that first made
    /// the record allowed. Callers enqueue settlement on this edge.
    pub newly_allowed: bool,
}

/// Merges verification evidence and answers eligibility queries.
#[derive(Clone)]
pub struct VerificationAggregator {
    store: Arc<dyn VerificationStore>,
    policy: EligibilityPolicy,
    clock: Arc<dyn Clock>,
}

impl VerificationAggregator {
    #[must_use]
    pub fn new(
        store: Arc<dyn VerificationStore>,
        policy: EligibilityPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    #[must_use]
    pub fn policy(&self) -> EligibilityPolicy {
        self.policy
    }

    pub async fn record(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        flag: VerificationFlag,
        ok: bool,
    ) -> Result<RecordOutcome> {
        let update = self
            .store
            .upsert_flag(user_id, place_id, flag, ok, self.clock.now_utc())
            .await?;
        let was_allowed = update
            .before
            .as_ref()
            .is_some_and(|r| r.eligibility(self.policy).allowed);
        let eligibility = update.after.eligibility(self.policy);
        let newly_allowed = eligibility.allowed && !was_allowed;

        debug!(user = %user_id, place = %place_id, %flag, ok, "verification flag merged");
        if newly_allowed {
            info!(user = %user_id, place = %place_id, "verification complete, reward eligible");
        }
        Ok(RecordOutcome {
            eligibility,
            newly_allowed,
        })
    }

    pub async fn record_gps(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        ok: bool,
    ) -> Result<RecordOutcome> {
        self.record(user_id, place_id, VerificationFlag::Gps, ok).await
    }

    pub async fn record_qr(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        ok: bool,
    ) -> Result<RecordOutcome> {
        self.record(user_id, place_id, VerificationFlag::Qr, ok).await
    }

    pub async fn record_receipt(
        &self,
        user_id: &UserId,
        place_id: &PlaceId,
        ok: bool,
    ) -> Result<RecordOutcome> {
        self.record(user_id, place_id, VerificationFlag::Receipt, ok)
            .await
    }

    /// All-false when no record exists.
    pub async fn get_eligibility(&self, user_id: &UserId, place_id: &PlaceId) -> Result<Eligibility> {
        Ok(self
            .store
            .get(user_id, place_id)
            .await?
            .map(|r| r.eligibility(self.policy))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visitpay_types::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn aggregator(policy: EligibilityPolicy) -> VerificationAggregator {
        VerificationAggregator::new(
            Arc::new(InMemoryVerificationStore::new()),
            policy,
            Arc::new(ManualClock::new(T0)),
        )
    }

    fn ids() -> (UserId, PlaceId) {
        (UserId::new("u1"), PlaceId::new("gangnam"))
    }

    #[tokio::test]
    async fn unknown_pair_is_all_false() {
        let agg = aggregator(EligibilityPolicy::default());
        let (u, p) = ids();
        assert_eq!(agg.get_eligibility(&u, &p).await.unwrap(), Eligibility::default());
    }

    #[tokio::test]
    async fn gps_then_qr_allows_once() {
        let agg = aggregator(EligibilityPolicy::default());
        let (u, p) = ids();

        let gps = agg.record_gps(&u, &p, true).await.unwrap();
        assert!(!gps.eligibility.allowed);
        assert!(!gps.newly_allowed);

        let qr = agg.record_qr(&u, &p, true).await.unwrap();
        assert!(qr.eligibility.allowed);
        assert!(qr.newly_allowed);

        let receipt = agg.record_receipt(&u, &p, true).await.unwrap();
        assert!(receipt.eligibility.allowed);
        assert!(!receipt.newly_allowed, "edge fires only once");
    }

    #[tokio::test]
    async fn gps_alone_or_second_factor_alone_denied() {
        let agg = aggregator(EligibilityPolicy::default());
        let (u, p) = ids();
        agg.record_qr(&u, &p, true).await.unwrap();
        agg.record_receipt(&u, &p, true).await.unwrap();
        assert!(!agg.get_eligibility(&u, &p).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn negative_evidence_does_not_clear() {
        let agg = aggregator(EligibilityPolicy::default());
        let (u, p) = ids();
        agg.record_gps(&u, &p, true).await.unwrap();
        agg.record_gps(&u, &p, false).await.unwrap();
        let e = agg.get_eligibility(&u, &p).await.unwrap();
        assert!(e.gps_ok);
    }

    #[tokio::test]
    async fn receipt_required_policy() {
        let agg = aggregator(EligibilityPolicy {
            receipt_required: true,
        });
        let (u, p) = ids();
        agg.record_gps(&u, &p, true).await.unwrap();
        let qr = agg.record_qr(&u, &p, true).await.unwrap();
        assert!(!qr.eligibility.allowed);
        let receipt = agg.record_receipt(&u, &p, true).await.unwrap();
        assert!(receipt.newly_allowed);
    }

    #[tokio::test]
    async fn records_are_stamped_from_the_injected_clock() {
        let store = Arc::new(InMemoryVerificationStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let agg = VerificationAggregator::new(
            store.clone(),
            EligibilityPolicy::default(),
            clock.clone(),
        );
        let (u, p) = ids();

        agg.record_gps(&u, &p, true).await.unwrap();
        let first = store.get(&u, &p).await.unwrap().unwrap();
        assert_eq!(first.updated_at.timestamp_millis(), 1_700_000_000_000);

        clock.advance(30_000);
        agg.record_qr(&u, &p, true).await.unwrap();
        let second = store.get(&u, &p).await.unwrap().unwrap();
        assert_eq!(second.updated_at.timestamp_millis(), 1_700_000_030_000);
    }

    #[tokio::test]
    async fn places_are_independent() {
        let agg = aggregator(EligibilityPolicy::default());
        let u = UserId::new("u1");
        let a = PlaceId::new("gangnam");
        let b = PlaceId::new("hongdae");
        agg.record_gps(&u, &a, true).await.unwrap();
        agg.record_qr(&u, &b, true).await.unwrap();
        assert!(!agg.get_eligibility(&u, &a).await.unwrap().allowed);
        assert!(!agg.get_eligibility(&u, &b).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn concurrent_factor_updates_both_land() {
        let store = Arc::new(InMemoryVerificationStore::new());
        let agg = VerificationAggregator::new(
            store.clone(),
            EligibilityPolicy::default(),
            Arc::new(ManualClock::new(T0)),
        );
        let (u, p) = ids();

        let mut handles = Vec::new();
        for flag in [VerificationFlag::Gps, VerificationFlag::Qr, VerificationFlag::Receipt] {
            let agg = agg.clone();
            let (u, p) = (u.clone(), p.clone());
            handles.push(tokio::spawn(async move {
                agg.record(&u, &p, flag, true).await.unwrap()
            }));
        }
        let mut edges = 0;
        for h in handles {
            if h.await.unwrap().newly_allowed {
                edges += 1;
            }
        }

        let e = agg.get_eligibility(&u, &p).await.unwrap();
        assert!(e.gps_ok && e.qr_ok && e.receipt_ok);
        assert_eq!(edges, 1, "exactly one update crosses into allowed");
        assert_eq!(store.len(), 1);
    }
}
