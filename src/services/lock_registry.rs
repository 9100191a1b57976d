//! Per-object mutual exclusion for metadata read-modify-write sequences.

use crate::models::object_key::ObjectKey;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Hands out one async mutex per `(token, name)`.
///
/// Entries are created on first use and dropped again once no task holds or
/// waits for the key, so the map only grows with the number of keys in use.
/// Locks are process-local and are not re-entrant.
#[derive(Clone, Default)]
pub struct LockRegistry {
    locks: Arc<LockMap>,
}

/// Exclusive access to one key. Dropping it releases the key.
pub struct KeyGuard {
    key: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the caller holds `key` exclusively.
    pub async fn acquire(&self, key: &ObjectKey) -> KeyGuard {
        let lock_key = key.lock_key();
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(lock_key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            key: lock_key,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly; same as dropping the guard.
    pub fn release(self) {}
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Unlock while the map is held so no new waiter can slip in between
        // the unlock and the eviction check.
        drop(self.guard.take());
        let idle = locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("tok", name).unwrap()
    }

    #[tokio::test]
    async fn entries_are_evicted_when_idle() {
        let registry = LockRegistry::new();
        let guard = registry.acquire(&key("a.txt")).await;
        assert_eq!(guard.key(), "tok/a.txt");
        assert_eq!(registry.tracked_keys(), 1);
        guard.release();
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let registry = LockRegistry::new();
        let _a = registry.acquire(&key("a.txt")).await;
        let b = tokio::time::timeout(Duration::from_secs(1), registry.acquire(&key("b.txt")))
            .await;
        assert!(b.is_ok());
        assert_eq!(registry.tracked_keys(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_mutually_exclusive() {
        let registry = LockRegistry::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = registry.acquire(&key("shared.bin")).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let registry = LockRegistry::new();
        let first = registry.acquire(&key("a.txt")).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let guard = registry.acquire(&key("a.txt")).await;
                guard.release();
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        first.release();
        waiter.await.unwrap();
        assert_eq!(registry.tracked_keys(), 0);
    }
}
