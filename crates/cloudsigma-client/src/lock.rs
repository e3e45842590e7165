//! Per-resource mutual exclusion
//!
//! Full-object updates of a server (attaching or detaching an interface)
//! are read-modify-write. Two tasks touching the same server must not
//! interleave, so every such update holds the lock for that server's UUID.
//! Entries are pruned once no guard or waiter references them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slot = Arc<Mutex<()>>;

/// Async locks keyed by resource identifier
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<StdMutex<HashMap<String, Slot>>>,
}

/// Held lock on one key. Dropping it releases the key.
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<StdMutex<HashMap<String, Slot>>>,
}

impl KeyedLocks {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock on `key`
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            slots.entry(key.to_string()).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            slot,
            guard: Some(guard),
            slots: self.slots.clone(),
        }
    }

    /// Number of keys currently tracked (held or awaited)
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

impl KeyedGuard {
    /// Key this guard holds
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // map entry + this guard's clone; anything above is a waiter
        if Arc::strong_count(&self.slot) <= 2 {
            if let Some(existing) = slots.get(&self.key) {
                if Arc::ptr_eq(existing, &self.slot) {
                    slots.remove(&self.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("server-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn test_entry_pruned_after_release() {
        let locks = KeyedLocks::new();
        {
            let guard = locks.lock("x").await;
            assert_eq!(guard.key(), "x");
            assert_eq!(locks.tracked(), 1);
        }
        assert_eq!(locks.tracked(), 0);
    }
}
