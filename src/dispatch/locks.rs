//! Per-contact serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Hands out one async mutex per contact address, so events for the same
/// contact run strictly one at a time while different contacts proceed in
/// parallel.
#[derive(Default)]
pub struct ContactLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Entries are pruned once the map grows past this many idle locks.
const PRUNE_THRESHOLD: usize = 1024;

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `address`.
    pub async fn acquire(&self, address: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            if map.len() > PRUNE_THRESHOLD {
                // Only this map holds an idle entry's Arc.
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(map.entry(address.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Try to take the lock without waiting.
    pub fn try_acquire(&self, address: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(map.entry(address.to_string()).or_default())
        };
        lock.try_lock_owned().ok()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
