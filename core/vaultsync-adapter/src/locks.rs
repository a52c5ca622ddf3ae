//! Ids the sink is writing right now.
//!
//! When the sink applies an inbound change to the local store, the resulting
//! local write must not be echoed back. The sink locks the record's ids for
//! the duration of the write; locks expire on their own after `ttl`, so a
//! crashed writer never blocks an id for good.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use vaultsync_sync::LockSet;

/// How long a lock holds unless released earlier.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

/// Shared set of locked ids. Cheap to clone; clones share the set.
#[derive(Debug, Clone)]
pub struct LockedIds {
    locks: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl Default for LockedIds {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl LockedIds {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            locks: Arc::default(),
            ttl,
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Locks `id` until the TTL elapses. Locking a held id extends it.
    pub fn lock(&self, id: impl Into<String>) {
        let id = id.into();
        debug!(id = %id, "id locked");
        let now = Instant::now();
        let mut locks = self.locks();
        locks.retain(|_, deadline| *deadline > now);
        locks.insert(id, now + self.ttl);
    }

    /// Releases `id` early. Returns whether a live lock was held.
    pub fn unlock(&self, id: &str) -> bool {
        self.locks()
            .remove(id)
            .is_some_and(|deadline| deadline > Instant::now())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.locks()
            .get(id)
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Currently locked ids, sorted.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let now = Instant::now();
        let mut ids: Vec<String> = self
            .locks()
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl LockSet for LockedIds {
    fn is_locked(&self, id: &str) -> bool {
        self.contains(id)
    }
}
