//! Dedup and echo guard.
//!
//! The last gate before the sink. A change passes only if
//! 1. the sink is not holding a lock on its global id (echo of a sink write),
//! 2. the sink is not holding a lock on its local id (a record the sink is
//!    creating right now),
//! 3. it was not delivered within the dedup TTL and is not being delivered
//!    by a concurrent task.
//!
//! The check and the in-flight claim happen under one lock
//! ([`check_and_claim`]), so two tasks racing on one id cannot both pass.
//! Different ids never wait on each other beyond that short critical
//! section.

use crate::error::SyncResult;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use vaultsync_types::{ChangeEvent, EntityId, GlobalId, TableName};

/// Ids the sink is currently writing. Owned by the sink; read-only here.
pub trait LockSet: Send + Sync {
    fn is_locked(&self, id: &str) -> bool;
}

/// Translation from local ids to the sink's global ids.
#[async_trait]
pub trait GlobalIdLookup: Send + Sync {
    async fn global_id(&self, local: &EntityId, table: &TableName) -> SyncResult<Option<GlobalId>>;
}

/// Identity of a change for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuardKey {
    pub table: TableName,
    pub id: EntityId,
}

impl GuardKey {
    #[must_use]
    pub fn of(event: &ChangeEvent) -> Self {
        Self {
            table: event.table_name.clone(),
            id: event.entity_id.clone(),
        }
    }
}

/// Why a change was stopped, or that it may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Claimed; the caller must call [`EchoGuard::complete`] when done.
    Proceed,
    /// The sink holds a lock on the global id.
    EchoGlobal,
    /// The sink holds a lock on the local id.
    EchoLocal,
    /// Delivered within the TTL.
    Duplicate,
    /// Being delivered right now by another task.
    InFlight,
}

/// Processed and in-flight ids.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    /// Delivered ids with their eviction deadline.
    processed: HashMap<GuardKey, Instant>,
    in_flight: HashSet<GuardKey>,
}

impl DedupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` was delivered and its TTL has not elapsed at `now`.
    #[must_use]
    pub fn is_processed(&self, key: &GuardKey, now: Instant) -> bool {
        self.processed.get(key).is_some_and(|deadline| *deadline > now)
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &GuardKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Marks `key` delivered until `now + ttl`.
    pub fn mark_processed(&mut self, key: GuardKey, now: Instant, ttl: Duration) {
        self.processed.insert(key, now + ttl);
    }

    /// Releases an in-flight claim.
    pub fn release(&mut self, key: &GuardKey) {
        self.in_flight.remove(key);
    }

    /// Forgets a delivered id. Returns whether it was present.
    pub fn evict(&mut self, key: &GuardKey) -> bool {
        self.processed.remove(key).is_some()
    }

    /// Drops entries whose TTL elapsed. Returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.processed.len();
        self.processed.retain(|_, deadline| *deadline > now);
        before - self.processed.len()
    }

    /// Drops every processed entry. In-flight claims are kept.
    pub fn clear_processed(&mut self) -> usize {
        let cleared = self.processed.len();
        self.processed.clear();
        cleared
    }

    /// Live processed entries at `now`.
    #[must_use]
    pub fn processed_len(&self, now: Instant) -> usize {
        self.processed.values().filter(|deadline| **deadline > now).count()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

/// The guard check proper: echo checks, dedup checks, then claim.
///
/// Pure apart from mutating `registry`; the caller supplies the clock and
/// the already-resolved global id.
pub fn check_and_claim(
    registry: &mut DedupRegistry,
    key: &GuardKey,
    global_id: Option<&GlobalId>,
    locks: Option<&dyn LockSet>,
    now: Instant,
) -> Verdict {
    if let Some(locks) = locks {
        if global_id.is_some_and(|g| locks.is_locked(g.as_str())) {
            return Verdict::EchoGlobal;
        }
        if locks.is_locked(key.id.as_str()) {
            return Verdict::EchoLocal;
        }
    }
    if registry.is_processed(key, now) {
        return Verdict::Duplicate;
    }
    if registry.is_in_flight(key) {
        return Verdict::InFlight;
    }
    registry.in_flight.insert(key.clone());
    Verdict::Proceed
}

/// Shared guard used by every worker of an engine.
pub struct EchoGuard {
    registry: Mutex<DedupRegistry>,
    ttl: Duration,
    locks: Option<Arc<dyn LockSet>>,
    global_ids: Option<Arc<dyn GlobalIdLookup>>,
}

impl EchoGuard {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            registry: Mutex::default(),
            ttl,
            locks: None,
            global_ids: None,
        }
    }

    #[must_use]
    pub fn with_locks(mut self, locks: Arc<dyn LockSet>) -> Self {
        self.locks = Some(locks);
        self
    }

    #[must_use]
    pub fn with_global_ids(mut self, lookup: Arc<dyn GlobalIdLookup>) -> Self {
        self.global_ids = Some(lookup);
        self
    }

    fn registry(&self) -> MutexGuard<'_, DedupRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the global id, then runs [`check_and_claim`].
    pub async fn admit(&self, event: &ChangeEvent) -> Verdict {
        let global_id = match &self.global_ids {
            Some(lookup) => match lookup.global_id(&event.entity_id, &event.table_name).await {
                Ok(found) => found,
                Err(e) => {
                    // without a mapping the local id is the key
                    warn!(entity_id = %event.entity_id, error = %e, "global id lookup failed");
                    None
                }
            },
            None => None,
        };
        let key = GuardKey::of(event);
        let verdict = check_and_claim(
            &mut self.registry(),
            &key,
            global_id.as_ref(),
            self.locks.as_deref(),
            Instant::now(),
        );
        if verdict != Verdict::Proceed {
            debug!(table = %key.table, entity_id = %key.id, ?verdict, "change held back");
        }
        verdict
    }

    /// Ends a claim. Delivered changes enter the processed set for the TTL;
    /// failed ones do not, so a later notification can deliver them.
    pub fn complete(&self, key: &GuardKey, delivered: bool) {
        let mut registry = self.registry();
        registry.release(key);
        if delivered {
            registry.mark_processed(key.clone(), Instant::now(), self.ttl);
        }
    }

    /// Forgets a delivered id so a re-creation is not suppressed.
    pub fn evict(&self, key: &GuardKey) -> bool {
        self.registry().evict(key)
    }

    /// Clears the processed set.
    pub fn clear_processed(&self) -> usize {
        self.registry().clear_processed()
    }

    /// Removes expired entries.
    pub fn purge_expired(&self) -> usize {
        self.registry().purge_expired(Instant::now())
    }

    #[must_use]
    pub fn is_processed(&self, key: &GuardKey) -> bool {
        self.registry().is_processed(key, Instant::now())
    }

    /// `(processed, in_flight)` counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let registry = self.registry();
        (registry.processed_len(Instant::now()), registry.in_flight_len())
    }
}
