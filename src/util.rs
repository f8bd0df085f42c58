//! Shared Utilities
//! Mission: Keyed advisory locks for per-order and per-position mutation

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// A map of named `tokio` mutexes, created on first use.
///
/// Used for the per-(binding, venue-order-id) lock in the executor and the
/// per-(binding, symbol) lock in the position tracker. The registry itself
/// takes only a short synchronous critical section; the returned lock is
/// held across await points by the caller.
#[derive(Default)]
pub struct LockMap {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for `key`. Lock it with `.lock().await`.
    pub fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Number of keys ever locked. Diagnostics only.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Build the executor's per-order lock key.
pub fn order_lock_key(binding_id: i64, venue_order_id: &str) -> String {
    format!("{binding_id}:{venue_order_id}")
}

/// Build the tracker's per-position lock key.
pub fn position_lock_key(binding_id: i64, symbol: &str) -> String {
    format!("{binding_id}:{symbol}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_key_returns_same_lock() {
        let locks = LockMap::new();
        let a = locks.entry("1:V1");
        let b = locks.entry("1:V1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = LockMap::new();
        let a = locks.entry("1:V1");
        let b = locks.entry("2:V1");
        let _guard_a = a.lock().await;
        // Would deadlock if the two keys shared a mutex.
        let _guard_b = b.lock().await;
        assert_eq!(locks.len(), 2);
    }
}
