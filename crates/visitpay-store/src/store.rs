//! Shared counter and lease store.
//!
//! The trait mirrors the handful of atomic primitives a networked key-value
//! store offers (`INCR` + `EXPIRE`, `SET NX PX`, compare-and-delete). Callers
//! never read-modify-write; every mutation is a single atomic call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use visitpay_types::{Clock, Result, VisitpayError};

/// Counter value after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    /// Count including this increment.
    pub count: u64,
    /// Time until the counter expires.
    pub ttl_remaining_ms: u64,
}

/// Atomic primitives shared by the lock manager and the rate limiter.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically increment `key`. The TTL is applied when the increment
    /// creates the counter (first hit of a window) and left alone afterwards.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<CounterState>;

    /// Create `key = value` with a TTL only if no live entry exists.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read a live string entry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete unconditionally. Returns whether a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete only if the live value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Text(String),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Slot {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now_ms)
    }
}

/// In-process store backed by a concurrent map.
///
/// Expired entries are swept lazily at the start of every call, so no
/// background timer is needed. Per-key atomicity comes from the map's entry
/// API, which holds the shard lock for the whole update.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, now_ms: u64) -> u64 {
        self.entries.retain(|_, slot| slot.is_live(now_ms));
        now_ms
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<CounterState> {
        let now = self.sweep(self.clock.now_ms());
        let mut slot = self.entries.entry(key.to_string()).or_insert(Slot {
            value: Value::Counter(0),
            expires_at_ms: None,
        });
        let count = match &mut slot.value {
            Value::Counter(c) => {
                *c += 1;
                *c
            }
            Value::Text(_) => {
                return Err(VisitpayError::Internal(format!(
                    "key {key} holds a string, not a counter"
                )));
            }
        };
        if count == 1 {
            slot.expires_at_ms = Some(now.saturating_add(ttl_ms(ttl)));
        }
        let ttl_remaining_ms = slot
            .expires_at_ms
            .map_or(u64::MAX, |at| at.saturating_sub(now));
        Ok(CounterState {
            count,
            ttl_remaining_ms,
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.sweep(self.clock.now_ms());
        let slot = Slot {
            value: Value::Text(value.to_string()),
            expires_at_ms: Some(now.saturating_add(ttl_ms(ttl))),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(slot);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.sweep(self.clock.now_ms());
        Ok(self.entries.get(key).and_then(|slot| match &slot.value {
            Value::Text(v) if slot.is_live(now) => Some(v.clone()),
            _ => None,
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.sweep(self.clock.now_ms());
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let now = self.sweep(self.clock.now_ms());
        Ok(self
            .entries
            .remove_if(key, |_, slot| {
                slot.is_live(now) && matches!(&slot.value, Value::Text(v) if v == expected)
            })
            .is_some())
    }
}

/// A store that is always unreachable. For exercising fail-open paths.
#[cfg(any(test, feature = "test-helpers"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineStore;

#[cfg(any(test, feature = "test-helpers"))]
impl OfflineStore {
    fn down<T>() -> Result<T> {
        Err(VisitpayError::StoreUnavailable {
            reason: "connection refused".to_string(),
        })
    }
}

#[cfg(any(test, feature = "test-helpers"))]
#[async_trait]
impl SharedStore for OfflineStore {
    async fn incr(&self, _key: &str, _ttl: Duration) -> Result<CounterState> {
        Self::down()
    }

    async fn set_nx(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool> {
        Self::down()
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Self::down()
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Self::down()
    }

    async fn compare_and_delete(&self, _key: &str, _expected: &str) -> Result<bool> {
        Self::down()
    }
}
