//! Dispatch to the sink.
//!
//! The dispatcher makes exactly one call per guard-approved change and does
//! not retry. A failure is logged and the change dropped, or parked in the
//! [`DeliveryOutbox`] when one is configured.

use crate::error::SyncResult;
use crate::outbox::DeliveryOutbox;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use vaultsync_types::{ChangeEvent, TableName};

/// The external store receiving changes.
///
/// Delivery is at-least-once, so implementations must tolerate receiving
/// the same change twice.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Delivers one change: `event.sink_data()` routed by `event.table_name`.
    async fn handle_change(&self, event: &ChangeEvent) -> SyncResult<()>;

    /// Whether the sink wants changes for `table` at all.
    fn accepts(&self, _table: &TableName) -> bool {
        true
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Failed,
}

/// Calls the sink and keeps delivery counters.
pub struct Dispatcher {
    sink: Arc<dyn Sink>,
    outbox: Option<DeliveryOutbox>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Dispatcher {
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>, outbox: Option<DeliveryOutbox>) -> Self {
        Self {
            sink,
            outbox,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn accepts(&self, table: &TableName) -> bool {
        self.sink.accepts(table)
    }

    #[must_use]
    pub fn outbox(&self) -> Option<&DeliveryOutbox> {
        self.outbox.as_ref()
    }

    /// Sends a change. Failures go to the outbox if there is one.
    pub async fn dispatch(&self, event: &ChangeEvent) -> DispatchOutcome {
        match self.send(event).await {
            Ok(()) => DispatchOutcome::Delivered,
            Err(message) => {
                if let Some(outbox) = &self.outbox {
                    if let Err(e) = outbox.push(event, &message) {
                        error!(
                            table = %event.table_name,
                            entity_id = %event.entity_id,
                            error = %e,
                            "failed to park change in outbox"
                        );
                    }
                }
                DispatchOutcome::Failed
            }
        }
    }

    /// Sends a change without touching the outbox. Used for replays.
    pub async fn redeliver(&self, event: &ChangeEvent) -> Result<(), String> {
        self.send(event).await
    }

    async fn send(&self, event: &ChangeEvent) -> Result<(), String> {
        match self.sink.handle_change(event).await {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    table = %event.table_name,
                    entity_id = %event.entity_id,
                    operation = %event.operation,
                    "change delivered"
                );
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    table = %event.table_name,
                    entity_id = %event.entity_id,
                    operation = %event.operation,
                    error = %e,
                    "sink delivery failed"
                );
                Err(e.to_string())
            }
        }
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// A recording sink for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Sink that records every change it is handed.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        calls: Mutex<Vec<ChangeEvent>>,
        failing: AtomicBool,
        latency: Mutex<Option<Duration>>,
        rejected_tables: Mutex<HashSet<String>>,
    }

    impl RecordingSink {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Makes every delivery fail until switched off. Failed calls are
        /// still recorded.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Delays every delivery.
        pub fn set_latency(&self, latency: Option<Duration>) {
            *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
        }

        /// Makes `accepts` refuse `table`.
        pub fn reject_table(&self, table: &str) {
            self.rejected_tables
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(table.to_string());
        }

        /// Every change handed to the sink, in call order.
        #[must_use]
        pub fn calls(&self) -> Vec<ChangeEvent> {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        #[must_use]
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn handle_change(&self, event: &ChangeEvent) -> SyncResult<()> {
            let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            if self.failing.load(Ordering::SeqCst) {
                return Err(SyncError::Sink("mock sink failure".into()));
            }
            Ok(())
        }

        fn accepts(&self, table: &TableName) -> bool {
            !self
                .rejected_tables
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(table.as_str())
        }
    }
}
