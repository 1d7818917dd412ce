//! Per-owner job serialization.

use facetag_store::OwnerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// One async mutex per owner, created on demand.
///
/// Entries nobody holds or waits on are dropped the next time any lock is
/// taken, so the map only tracks owners with jobs in flight.
#[derive(Default)]
pub struct OwnerLocks {
    inner: Mutex<HashMap<OwnerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl OwnerLocks {
    /// Wait until no other job of `owner_id` is running.
    pub async fn lock(&self, owner_id: OwnerId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|owner, lock| *owner == owner_id || Arc::strong_count(lock) > 1);
            map.entry(owner_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Owners with a job holding or waiting on their lock.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|lock| Arc::strong_count(lock) > 1).count()
    }
}
