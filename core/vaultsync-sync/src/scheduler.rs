//! Consistency scheduling.
//!
//! Update callbacks fire before the enclosing transaction is visible and
//! often carry only the changed fields. Such notifications are reloaded from
//! committed state after a per-kind delay. The reload runs as a timer task so
//! the workers keep draining the queue meanwhile.
//!
//! While a reload for `(table, id)` is pending, later notifications for the
//! same key are folded into it: the reload reads the latest state anyway.

use crate::entity::EntityKind;
use crate::guard::GuardKey;
use crate::observer::Notification;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;
use vaultsync_types::{Operation, Record};

/// How a notification's record is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPlan {
    /// The notification carries the whole record.
    UsePayload,
    /// Read committed state now.
    ReloadNow,
    /// Read committed state after the delay.
    ReloadAfter(Duration),
}

/// Decides how to obtain the record for a created or updated notification.
///
/// Complete records are used as-is unless the kind needs relations. Bare
/// creations come from sources that report committed rows and are read
/// immediately. Everything else waits for the kind's consistency delay.
#[must_use]
pub fn plan(kind: &EntityKind, notification: &Notification) -> LoadPlan {
    let has_payload = notification.complete && notification.entity.is_some();
    match notification.operation {
        Operation::Removed => LoadPlan::UsePayload,
        _ if has_payload && kind.relations().is_empty() => LoadPlan::UsePayload,
        Operation::Created if !has_payload => LoadPlan::ReloadNow,
        _ => LoadPlan::ReloadAfter(kind.consistency_delay()),
    }
}

/// Splits relation fragments out of a reloaded row.
///
/// Returns the row without the relation keys, and the fragments in `heads`
/// order. Heads missing from the row are skipped.
#[must_use]
pub fn split_relations(mut row: Record, heads: &[&str]) -> (Record, Vec<(String, Value)>) {
    let fragments = heads
        .iter()
        .filter_map(|head| row.remove(*head).map(|v| ((*head).to_string(), v)))
        .collect();
    (row, fragments)
}

/// Pending deferred reloads, keyed by entity.
#[derive(Debug, Default)]
pub struct ConsistencyScheduler {
    pending: Arc<Mutex<HashMap<GuardKey, AbortHandle>>>,
}

impl ConsistencyScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<GuardKey, AbortHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `work` after `delay` unless a reload for `key` is already
    /// pending. Returns `false` when the notification was coalesced.
    pub fn defer<F>(&self, key: GuardKey, delay: Duration, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending();
        if pending.contains_key(&key) {
            debug!(table = %key.table, entity_id = %key.id, "reload already pending, coalesced");
            return false;
        }
        let registry = Arc::clone(&self.pending);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_key);
            work.await;
        });
        pending.insert(key, task.abort_handle());
        true
    }

    #[must_use]
    pub fn is_pending(&self, key: &GuardKey) -> bool {
        self.pending().contains_key(key)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending().len()
    }

    /// Cancels every reload still waiting for its delay. Reloads already
    /// running are left to finish.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending();
        let cancelled = pending.len();
        for (_, task) in pending.drain() {
            task.abort();
        }
        cancelled
    }
}
