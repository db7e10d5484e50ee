//! Per-key async mutual exclusion
//!
//! Slots are created on first use and dropped again once nobody holds or
//! waits on them, so the map only ever contains keys that are in use.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

pub struct KeyedLocks<K> {
    slots: Slots<K>,
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        slots.entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let slot = self.slot(&key);
        let guard = slot.lock_owned().await;
        KeyGuard {
            key,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Exclusive access to `key` if nobody holds it right now
    pub fn try_lock(&self, key: K) -> Option<KeyGuard<K>> {
        let slot = self.slot(&key);
        let guard = slot.try_lock_owned().ok()?;
        Some(KeyGuard {
            key,
            slots: self.slots.clone(),
            guard: Some(guard),
        })
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock on one key; released on drop
pub struct KeyGuard<K: Eq + Hash> {
    key: K,
    slots: Slots<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

#[cfg(test)]
impl<K: Eq + Hash> KeyGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.slots.lock();
        // Only the map's own reference left: no holder, no waiter.
        if slots
            .get(&self.key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false)
        {
            slots.remove(&self.key);
        }
    }
}
