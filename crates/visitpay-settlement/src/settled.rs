//! Bounded memory of idempotency keys settled by this process.
//!
//! A second job for an already-settled key is completed without calling the
//! provider. The set is bounded: when full, the oldest key is evicted and
//! the provider's own idempotency becomes the only guard for it.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use visitpay_types::{Result, VisitpayError};

/// Keys remembered by a worker's guard unless one is supplied.
pub const DEFAULT_SETTLED_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct Inner {
    settled: HashSet<String>,
    order: VecDeque<String>,
}

/// Settled-key guard with FIFO eviction.
#[derive(Debug)]
pub struct SettledKeys {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl SettledKeys {
    /// A guard remembering at most `max_size` keys (at least one).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_size: max_size.max(1),
        }
    }

    /// Record `key` as settled.
    ///
    /// # Errors
    /// Returns [`VisitpayError::AlreadySettled`] if the key is already known.
    pub fn mark_settled(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.settled.contains(key) {
            return Err(VisitpayError::AlreadySettled {
                idempotency_key: key.to_string(),
            });
        }
        if inner.settled.len() >= self.max_size {
            if let Some(oldest) = inner.order.pop_front() {
                inner.settled.remove(&oldest);
            }
        }
        inner.settled.insert(key.to_string());
        inner.order.push_back(key.to_string());
        Ok(())
    }

    #[must_use]
    pub fn is_settled(&self, key: &str) -> bool {
        self.inner.lock().settled.contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().settled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_mark_is_rejected() {
        let keys = SettledKeys::new(10);
        keys.mark_settled("u:p:m").unwrap();
        let err = keys.mark_settled("u:p:m").unwrap_err();
        assert!(
            matches!(err, VisitpayError::AlreadySettled { ref idempotency_key } if idempotency_key == "u:p:m"),
            "got {err:?}"
        );
    }

    #[test]
    fn evicts_oldest() {
        let keys = SettledKeys::new(2);
        keys.mark_settled("a").unwrap();
        keys.mark_settled("b").unwrap();
        keys.mark_settled("c").unwrap();
        assert_eq!(keys.len(), 2);
        assert!(!keys.is_settled("a"));
        assert!(keys.is_settled("b"));
        assert!(keys.is_settled("c"));
    }
}
