//! Source observers.
//!
//! An observer attaches to a system of record and pushes raw
//! [`Notification`]s onto the engine's queue. It makes no delivery decisions
//! and never talks to the sink. Transport failures are reported through the
//! [`ObserverContext`] to the connection supervisor instead of being
//! swallowed.
//!
//! Two strategies exist:
//! - [`commit_hook`]: insert/update/delete callbacks, including the SQLite
//!   commit feed
//! - [`snapshot`]: real-time snapshot subscriptions on a document collection

pub mod commit_hook;
pub mod snapshot;

use crate::error::{SyncError, SyncResult};
use crate::supervisor::WatcherState;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use vaultsync_types::{EntityId, Operation, Record};

/// A raw change as reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub operation: Operation,
    /// Table or collection name as the source reports it.
    pub table: String,
    /// Id reported alongside the event, if any.
    pub entity_id: Option<EntityId>,
    /// Entity data carried by the event. For updates this is often only the
    /// changed fields.
    pub entity: Option<Record>,
    /// The row as the source last loaded it, when provided.
    pub database_entity: Option<Record>,
    /// `entity` holds every field of the record and can be used as-is.
    pub complete: bool,
}

impl Notification {
    /// A notification carrying a complete record.
    #[must_use]
    pub fn full(operation: Operation, table: impl Into<String>, id: EntityId, record: Record) -> Self {
        Self {
            operation,
            table: table.into(),
            entity_id: Some(id),
            entity: Some(record),
            database_entity: None,
            complete: true,
        }
    }

    /// A notification carrying only an id.
    #[must_use]
    pub fn bare(operation: Operation, table: impl Into<String>, id: EntityId) -> Self {
        Self {
            operation,
            table: table.into(),
            entity_id: Some(id),
            entity: None,
            database_entity: None,
            complete: false,
        }
    }
}

/// Handle an observer uses to emit notifications and report failures.
#[derive(Debug, Clone)]
pub struct ObserverContext {
    notifications: mpsc::Sender<Notification>,
    errors: mpsc::UnboundedSender<SyncError>,
    watcher: Arc<Mutex<WatcherState>>,
}

impl ObserverContext {
    pub fn new(
        notifications: mpsc::Sender<Notification>,
        errors: mpsc::UnboundedSender<SyncError>,
        watcher: Arc<Mutex<WatcherState>>,
    ) -> Self {
        Self {
            notifications,
            errors,
            watcher,
        }
    }

    /// Records activity on the channel and returns whether this is the first
    /// notification since the observer (re)started.
    pub fn mark_notified(&self) -> bool {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        watcher.last_activity = Instant::now();
        watcher.retry_count = 0;
        let first = !watcher.first_notification_received;
        watcher.first_notification_received = true;
        first
    }

    /// Queues a notification. Waits while the queue is full.
    pub async fn emit(&self, notification: Notification) -> SyncResult<()> {
        self.mark_notified();
        self.notifications
            .send(notification)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    /// Reports a transport failure to the supervisor.
    pub fn report(&self, error: SyncError) {
        // a closed channel means the supervisor is gone; nothing left to tell
        let _ = self.errors.send(error);
    }
}

/// A source of raw change notifications.
#[async_trait]
pub trait SourceObserver: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Establishes the subscription. Returns once notifications can flow;
    /// an error means the subscription could not be established.
    async fn start(&mut self, ctx: ObserverContext) -> SyncResult<()>;

    /// Tears the subscription down. Idempotent.
    async fn stop(&mut self);

    /// Whether a subscription is currently established.
    fn is_running(&self) -> bool;
}

/// A scriptable observer for testing supervisors and engines.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct Shared {
        starts: AtomicU32,
        stops: AtomicU32,
        failing_starts: AtomicU32,
        always_fail: AtomicBool,
        ctx: Mutex<Option<ObserverContext>>,
    }

    /// Observer whose start outcome and notifications are driven by a
    /// [`MockControl`].
    #[derive(Debug)]
    pub struct MockObserver {
        shared: Arc<Shared>,
        running: bool,
    }

    /// Test-side control of a [`MockObserver`].
    #[derive(Debug, Clone)]
    pub struct MockControl {
        shared: Arc<Shared>,
    }

    impl MockObserver {
        #[must_use]
        pub fn new() -> (Self, MockControl) {
            let shared = Arc::new(Shared::default());
            (
                Self {
                    shared: Arc::clone(&shared),
                    running: false,
                },
                MockControl { shared },
            )
        }
    }

    impl MockControl {
        /// Number of `start` calls so far.
        #[must_use]
        pub fn starts(&self) -> u32 {
            self.shared.starts.load(Ordering::SeqCst)
        }

        /// Number of `stop` calls so far.
        #[must_use]
        pub fn stops(&self) -> u32 {
            self.shared.stops.load(Ordering::SeqCst)
        }

        /// Makes the next `n` starts fail.
        pub fn fail_next_starts(&self, n: u32) {
            self.shared.failing_starts.store(n, Ordering::SeqCst);
        }

        /// Makes every start fail until switched off.
        pub fn fail_all_starts(&self, fail: bool) {
            self.shared.always_fail.store(fail, Ordering::SeqCst);
        }

        fn ctx(&self) -> Option<ObserverContext> {
            self.shared
                .ctx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Emits a notification through the current subscription. Returns
        /// `false` when no subscription is established.
        pub async fn emit(&self, notification: Notification) -> bool {
            match self.ctx() {
                Some(ctx) => ctx.emit(notification).await.is_ok(),
                None => false,
            }
        }

        /// Simulates a transport failure on the current subscription.
        pub fn fail(&self, reason: &str) -> bool {
            match self.ctx() {
                Some(ctx) => {
                    ctx.report(SyncError::Transport(reason.to_string()));
                    true
                }
                None => false,
            }
        }
    }

    #[async_trait]
    impl SourceObserver for MockObserver {
        fn name(&self) -> &str {
            "mock"
        }

        async fn start(&mut self, ctx: ObserverContext) -> SyncResult<()> {
            self.shared.starts.fetch_add(1, Ordering::SeqCst);
            let scripted_failure = self
                .shared
                .failing_starts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if scripted_failure || self.shared.always_fail.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("mock start failure".into()));
            }
            *self.shared.ctx.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
            self.running = true;
            Ok(())
        }

        async fn stop(&mut self) {
            self.shared.stops.fetch_add(1, Ordering::SeqCst);
            *self.shared.ctx.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }
}
