//! Sync engine: wiring of the pipeline.
//!
//! ```text
//! observer ─▶ queue ─▶ workers ─▶ registry ─▶ junction ─▶ scheduler ─▶ guard ─▶ dispatcher ─▶ sink
//!    ▲
//!    └── supervisor (start / health check / reconnect)
//! ```
//!
//! Each notification is processed independently by one of `worker_count`
//! workers. Deferred reloads run as timer tasks, so a pending reload never
//! holds a worker. The only state shared between notifications is the
//! guard's registry and the scheduler's pending map.

use crate::config::EngineConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher, Sink};
use crate::entity::{EntityKind, EntityRegistry, Resolved};
use crate::error::{SyncError, SyncResult};
use crate::guard::{EchoGuard, GlobalIdLookup, GuardKey, LockSet, Verdict};
use crate::junction::translate;
use crate::observer::commit_hook::resolve_entity_id;
use crate::observer::{Notification, SourceObserver};
use crate::outbox::DeliveryOutbox;
use crate::scheduler::{plan, split_relations, ConsistencyScheduler, LoadPlan};
use crate::supervisor::{SupervisorHandle, SupervisorState};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vaultsync_storage::RecordStore;
use vaultsync_types::{ChangeEvent, EntityId, Operation, Record};

/// Point-in-time view of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Ids delivered within the dedup TTL.
    pub processed: usize,
    /// Ids being delivered right now.
    pub in_flight: usize,
    /// Reloads waiting for their consistency delay.
    pub pending_reloads: usize,
    pub supervisor_state: SupervisorState,
    pub retry_count: u32,
    pub current_attempt: u32,
    /// Time since the source last delivered anything (ms).
    pub last_activity_age_ms: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Notifications dropped before dispatch (echo, duplicate, unresolvable,
    /// filtered, unsynced table).
    pub dropped: u64,
}

/// Outcome of [`Engine::replay_outbox`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    pub failed: usize,
    /// Entries removed because a newer delivery already went out.
    pub superseded: usize,
    /// Entries left in place (echo or in flight).
    pub skipped: usize,
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: EntityRegistry,
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn Sink>,
    locks: Option<Arc<dyn LockSet>>,
    global_ids: Option<Arc<dyn GlobalIdLookup>>,
    outbox: Option<DeliveryOutbox>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Lock set consulted by the echo checks.
    #[must_use]
    pub fn locks(mut self, locks: Arc<dyn LockSet>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Global id lookup used before the echo checks.
    #[must_use]
    pub fn global_ids(mut self, lookup: Arc<dyn GlobalIdLookup>) -> Self {
        self.global_ids = Some(lookup);
        self
    }

    /// Parks failed deliveries instead of dropping them.
    #[must_use]
    pub fn outbox(mut self, outbox: DeliveryOutbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let mut guard = EchoGuard::new(self.config.dedup_ttl());
        if let Some(locks) = self.locks {
            guard = guard.with_locks(locks);
        }
        if let Some(lookup) = self.global_ids {
            guard = guard.with_global_ids(lookup);
        }
        Engine {
            pipeline: Arc::new(Pipeline {
                registry: self.registry,
                store: self.store,
                guard,
                dispatcher: Dispatcher::new(self.sink, self.outbox),
                scheduler: ConsistencyScheduler::new(),
                dropped: AtomicU64::new(0),
            }),
            config: self.config,
            supervisor: Mutex::new(None),
            running: Mutex::new(None),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    sweep: JoinHandle<()>,
}

/// The change capture and sync engine for one observed source.
pub struct Engine {
    pipeline: Arc<Pipeline>,
    config: EngineConfig,
    supervisor: Mutex<Option<Arc<SupervisorHandle>>>,
    running: Mutex<Option<Running>>,
}

impl Engine {
    /// Starts building an engine with the default configuration.
    #[must_use]
    pub fn builder(
        registry: EntityRegistry,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn Sink>,
    ) -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            registry,
            store,
            sink,
            locks: None,
            global_ids: None,
            outbox: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.pipeline.registry
    }

    /// Starts the workers, the sweep and the supervised observer.
    pub fn start(&self, observer: Box<dyn SourceObserver>) -> SyncResult<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..self.config.worker_count.max(1) {
            // workers end on their own once shutdown is signalled
            tokio::spawn(worker(
                worker_id,
                Arc::clone(&self.pipeline),
                Arc::clone(&rx),
                shutdown_rx.clone(),
            ));
        }
        let sweep = tokio::spawn(sweep(
            Arc::clone(&self.pipeline),
            self.config.clone(),
            shutdown_rx,
        ));

        info!(
            observer = observer.name(),
            workers = self.config.worker_count,
            kinds = self.pipeline.registry.len(),
            "engine starting"
        );
        let supervisor = SupervisorHandle::spawn(observer, tx, &self.config);
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(supervisor));
        *running = Some(Running { shutdown, sweep });
        Ok(())
    }

    /// Stops observation and every engine timer. Idempotent.
    ///
    /// Deliveries already handed to the sink are left to finish; reloads
    /// still waiting for their delay are cancelled.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(running) = running else {
            return;
        };
        running.shutdown.send_replace(true);
        running.sweep.abort();

        let supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
        let cancelled = self.pipeline.scheduler.cancel_all();
        info!(cancelled_reloads = cancelled, "engine stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Current supervisor state; `Stopped` before the first start.
    #[must_use]
    pub fn supervisor_state(&self) -> SupervisorState {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(SupervisorState::Stopped, |s| s.state())
    }

    /// Receiver for supervisor transitions of the current run.
    #[must_use]
    pub fn subscribe_state(&self) -> Option<watch::Receiver<SupervisorState>> {
        self.supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.subscribe())
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let (processed, in_flight) = self.pipeline.guard.counts();
        let supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let (supervisor_state, watcher) = match &supervisor {
            Some(s) => (s.state(), Some(s.watcher())),
            None => (SupervisorState::Stopped, None),
        };
        EngineStats {
            processed,
            in_flight,
            pending_reloads: self.pipeline.scheduler.pending_len(),
            supervisor_state,
            retry_count: watcher.as_ref().map_or(0, |w| w.retry_count),
            current_attempt: watcher.as_ref().map_or(0, |w| w.current_attempt),
            last_activity_age_ms: watcher.as_ref().map_or(0, |w| {
                u64::try_from(w.last_activity.elapsed().as_millis()).unwrap_or(u64::MAX)
            }),
            delivered: self.pipeline.dispatcher.delivered(),
            failed: self.pipeline.dispatcher.failed(),
            dropped: self.pipeline.dropped.load(Ordering::Relaxed),
        }
    }

    /// Forgets every delivered id. Returns how many were cleared.
    pub fn clear_processed(&self) -> usize {
        let cleared = self.pipeline.guard.clear_processed();
        info!(cleared, "processed ids cleared");
        cleared
    }

    /// Re-submits parked deliveries through the guard.
    ///
    /// Without an outbox this does nothing.
    pub async fn replay_outbox(&self) -> SyncResult<ReplayReport> {
        let mut report = ReplayReport::default();
        let Some(outbox) = self.pipeline.dispatcher.outbox() else {
            return Ok(report);
        };
        let guard = &self.pipeline.guard;

        for entry in outbox.pending(usize::MAX)? {
            let key = GuardKey::of(&entry.event);
            match guard.admit(&entry.event).await {
                Verdict::Proceed => {}
                Verdict::Duplicate => {
                    outbox.remove(entry.seq)?;
                    report.superseded += 1;
                    continue;
                }
                _ => {
                    report.skipped += 1;
                    continue;
                }
            }

            let sent = self.pipeline.dispatcher.redeliver(&entry.event).await;
            let remember = sent.is_ok() && entry.event.operation != Operation::Removed;
            guard.complete(&key, remember);
            match sent {
                Ok(()) => {
                    outbox.remove(entry.seq)?;
                    report.delivered += 1;
                }
                Err(message) => {
                    outbox.record_failure(entry.seq, &message)?;
                    report.failed += 1;
                }
            }
        }
        info!(
            delivered = report.delivered,
            failed = report.failed,
            superseded = report.superseded,
            skipped = report.skipped,
            "outbox replayed"
        );
        Ok(report)
    }
}

async fn worker(
    worker_id: usize,
    pipeline: Arc<Pipeline>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Notification>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => None,
                notification = queue.recv() => notification,
            }
        };
        let Some(notification) = next else {
            break;
        };
        pipeline.process(notification).await;
    }
    debug!(worker = worker_id, "worker exiting");
}

async fn sweep(
    pipeline: Arc<Pipeline>,
    config: EngineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let ttl = config.dedup_ttl().max(std::time::Duration::from_millis(1));
    let full = config.sweep_interval().max(std::time::Duration::from_millis(1));
    let mut expire = interval_at(Instant::now() + ttl, ttl);
    let mut clear = interval_at(Instant::now() + full, full);
    expire.set_missed_tick_behavior(MissedTickBehavior::Delay);
    clear.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = expire.tick() => {
                let expired = pipeline.guard.purge_expired();
                if expired > 0 {
                    debug!(expired, "expired processed ids evicted");
                }
            }
            _ = clear.tick() => {
                let cleared = pipeline.guard.clear_processed();
                info!(cleared, "periodic sweep cleared processed ids");
            }
        }
    }
}

struct Pipeline {
    registry: EntityRegistry,
    store: Arc<dyn RecordStore>,
    guard: EchoGuard,
    dispatcher: Dispatcher,
    scheduler: ConsistencyScheduler,
    dropped: AtomicU64,
}

impl Pipeline {
    fn drop_one(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    async fn process(self: &Arc<Self>, notification: Notification) {
        match self.route(notification).await {
            Some((kind, notification)) => self.handle(kind, notification).await,
            None => self.drop_one(),
        }
    }

    /// Resolves the table once; junction rows become parent updates.
    async fn route(&self, notification: Notification) -> Option<(Arc<EntityKind>, Notification)> {
        match self.registry.resolve(&notification.table) {
            Resolved::Entity(kind) => Some((kind, notification)),
            Resolved::Junction(junction) => {
                if let Some(translated) = translate(&junction, &notification) {
                    return Some(translated);
                }
                let notification = self.load_junction_row(notification).await;
                let translated = translate(&junction, &notification);
                if translated.is_none() {
                    debug!(table = %notification.table, "junction row without parent id dropped");
                }
                translated
            }
            Resolved::Ignored => {
                debug!(table = %notification.table, "table not synced");
                None
            }
        }
    }

    /// Commit feeds report junction rows by key only; the parent id is read
    /// from the stored row. A removed row is gone and stays unresolved.
    async fn load_junction_row(&self, mut notification: Notification) -> Notification {
        let Some(key) = notification.entity_id.clone() else {
            return notification;
        };
        match self.store.find_row(&notification.table, &key).await {
            Ok(row) => notification.database_entity = row,
            Err(e) => warn!(table = %notification.table, error = %e, "junction row lookup failed"),
        }
        notification
    }

    async fn handle(self: &Arc<Self>, kind: Arc<EntityKind>, notification: Notification) {
        let table = kind.table().clone();
        if !self.dispatcher.accepts(&table) {
            debug!(table = %table, "sink has no mapping for table");
            self.drop_one();
            return;
        }

        let resolved =
            resolve_entity_id(self.store.as_ref(), kind.source_table(), &notification).await;
        let id = match resolved {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!(
                    table = %table,
                    operation = %notification.operation,
                    "notification without resolvable id dropped"
                );
                self.drop_one();
                return;
            }
            Err(e) => {
                warn!(table = %table, error = %e, "id resolution failed");
                self.drop_one();
                return;
            }
        };

        if notification.operation == Operation::Removed {
            let key = GuardKey {
                table: table.clone(),
                id: id.clone(),
            };
            if self.guard.evict(&key) {
                debug!(table = %table, entity_id = %id, "removed id evicted from processed set");
            }
            self.deliver(ChangeEvent::removed(table, id), false).await;
            return;
        }

        match plan(&kind, &notification) {
            LoadPlan::UsePayload => {
                let record = notification.entity.unwrap_or_default();
                self.emit(&kind, notification.operation, record).await;
            }
            LoadPlan::ReloadNow => self.reload_and_emit(kind, notification.operation, id).await,
            LoadPlan::ReloadAfter(delay) => {
                let key = GuardKey { table, id: id.clone() };
                let pipeline = Arc::clone(self);
                let operation = notification.operation;
                self.scheduler.defer(key, delay, async move {
                    pipeline.reload_and_emit(kind, operation, id).await;
                });
            }
        }
    }

    async fn reload_and_emit(&self, kind: Arc<EntityKind>, operation: Operation, id: EntityId) {
        match self.store.find_one(kind.source_table(), &id, kind.relations()).await {
            Ok(Some(row)) => self.emit(&kind, operation, row).await,
            Ok(None) => {
                warn!(table = %kind.table(), entity_id = %id, "entity gone before reload, dropped");
                self.drop_one();
            }
            Err(e) => {
                warn!(table = %kind.table(), entity_id = %id, error = %e, "reload failed");
                self.drop_one();
            }
        }
    }

    async fn emit(&self, kind: &EntityKind, operation: Operation, row: Record) {
        let (row, fragments) = split_relations(row, &kind.relation_heads());
        if !kind.forwards(&row) {
            debug!(table = %kind.table(), "forward filter rejected record");
            self.drop_one();
            return;
        }
        let built = match operation {
            Operation::Created => ChangeEvent::created(kind.table().clone(), &row),
            _ => ChangeEvent::updated(kind.table().clone(), &row),
        };
        let mut event = match built {
            Ok(event) => event,
            Err(e) => {
                warn!(table = %kind.table(), error = %e, "record cannot be forwarded");
                self.drop_one();
                return;
            }
        };
        for (name, fragment) in fragments {
            event = event.with_relation(name, fragment);
        }
        self.deliver(event, true).await;
    }

    /// Guard, dispatch, release. `remember` puts a delivered id into the
    /// processed set.
    async fn deliver(&self, event: ChangeEvent, remember: bool) {
        let key = GuardKey::of(&event);
        if self.guard.admit(&event).await != Verdict::Proceed {
            self.drop_one();
            return;
        }
        let outcome = self.dispatcher.dispatch(&event).await;
        self.guard.complete(&key, remember && outcome == DispatchOutcome::Delivered);
    }
}
