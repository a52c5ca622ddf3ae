//! Commit-hook observation.
//!
//! ORM-style sources call back after insert, update and remove. The event
//! may carry the full entity, only the changed fields, the previously loaded
//! row, or just an id, so the durable id is resolved in a fixed order:
//! aliases on the event entity, aliases on the loaded row, the explicit id,
//! and finally a lookup on the changed fields.

use super::{Notification, ObserverContext, SourceObserver};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vaultsync_storage::{RecordStore, RowAction, SqliteRecordStore};
use vaultsync_types::{extract_id, EntityId, Operation, Record};

/// One lifecycle callback from a commit-hook source.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub action: Operation,
    pub table: String,
    /// Entity passed to the callback.
    pub entity: Option<Record>,
    /// Row as loaded before the change (updates and removals).
    pub database_entity: Option<Record>,
    /// Id passed to the callback (removals usually carry one).
    pub entity_id: Option<EntityId>,
}

impl From<HookEvent> for Notification {
    fn from(event: HookEvent) -> Self {
        // inserted entities are whole; update payloads may be partial
        let complete = event.action == Operation::Created && event.entity.is_some();
        Self {
            operation: event.action,
            table: event.table,
            entity_id: event.entity_id,
            entity: event.entity,
            database_entity: event.database_entity,
            complete,
        }
    }
}

/// Resolves the durable id of the entity a notification is about.
///
/// Returns `Ok(None)` when every strategy fails; the caller drops the
/// notification.
pub async fn resolve_entity_id(
    store: &dyn RecordStore,
    source_table: &str,
    notification: &Notification,
) -> SyncResult<Option<EntityId>> {
    if let Some(id) = notification.entity.as_ref().and_then(extract_id) {
        return Ok(Some(id));
    }
    if let Some(id) = notification.database_entity.as_ref().and_then(extract_id) {
        return Ok(Some(id));
    }
    if let Some(id) = &notification.entity_id {
        return Ok(Some(id.clone()));
    }
    match &notification.entity {
        Some(fields) if !fields.is_empty() => {
            debug!(table = source_table, "no id on event, matching changed fields");
            let found = store.find_matching(source_table, fields).await?;
            Ok(found.as_ref().and_then(extract_id))
        }
        _ => Ok(None),
    }
}

#[derive(Debug, Default)]
struct HookShared {
    ctx: Mutex<Option<ObserverContext>>,
}

impl HookShared {
    fn ctx(&self) -> Option<ObserverContext> {
        self.ctx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, ctx: Option<ObserverContext>) {
        *self.ctx.lock().unwrap_or_else(PoisonError::into_inner) = ctx;
    }
}

/// Observer fed by explicit lifecycle callbacks through a [`HookHandle`].
///
/// Callbacks made while the observer is stopped are dropped, mirroring a
/// subscriber that has been unregistered.
#[derive(Debug)]
pub struct HookObserver {
    shared: Arc<HookShared>,
}

/// Callback side of a [`HookObserver`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HookHandle {
    shared: Arc<HookShared>,
}

impl HookObserver {
    #[must_use]
    pub fn new() -> (Self, HookHandle) {
        let shared = Arc::new(HookShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            HookHandle { shared },
        )
    }
}

impl HookHandle {
    /// Delivers a callback. Returns `false` if the observer is not running
    /// or the engine queue has closed.
    pub async fn emit(&self, event: HookEvent) -> bool {
        match self.shared.ctx() {
            Some(ctx) => ctx.emit(event.into()).await.is_ok(),
            None => false,
        }
    }

    pub async fn after_insert(&self, table: &str, entity: Record) -> bool {
        self.emit(HookEvent {
            action: Operation::Created,
            table: table.to_string(),
            entity: Some(entity),
            database_entity: None,
            entity_id: None,
        })
        .await
    }

    pub async fn after_update(
        &self,
        table: &str,
        entity: Record,
        database_entity: Option<Record>,
    ) -> bool {
        self.emit(HookEvent {
            action: Operation::Updated,
            table: table.to_string(),
            entity: Some(entity),
            database_entity,
            entity_id: None,
        })
        .await
    }

    pub async fn after_remove(
        &self,
        table: &str,
        entity_id: Option<EntityId>,
        database_entity: Option<Record>,
    ) -> bool {
        self.emit(HookEvent {
            action: Operation::Removed,
            table: table.to_string(),
            entity: None,
            database_entity,
            entity_id,
        })
        .await
    }

    /// Reports a connection failure from the hooked source.
    pub fn fail(&self, reason: &str) -> bool {
        match self.shared.ctx() {
            Some(ctx) => {
                ctx.report(SyncError::Transport(reason.to_string()));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SourceObserver for HookObserver {
    fn name(&self) -> &str {
        "commit-hook"
    }

    async fn start(&mut self, ctx: ObserverContext) -> SyncResult<()> {
        self.shared.set(Some(ctx));
        Ok(())
    }

    async fn stop(&mut self) {
        self.shared.set(None);
    }

    fn is_running(&self) -> bool {
        self.shared.ctx().is_some()
    }
}

/// Observer over the SQLite commit feed. Rows only reach it once their
/// transaction has committed, so reloads never see uncommitted state.
pub struct SqliteCommitObserver {
    store: Arc<SqliteRecordStore>,
    task: Option<JoinHandle<()>>,
}

impl SqliteCommitObserver {
    #[must_use]
    pub fn new(store: Arc<SqliteRecordStore>) -> Self {
        Self { store, task: None }
    }
}

#[async_trait]
impl SourceObserver for SqliteCommitObserver {
    fn name(&self) -> &str {
        "sqlite-commit"
    }

    async fn start(&mut self, ctx: ObserverContext) -> SyncResult<()> {
        if self.is_running() {
            return Err(SyncError::AlreadyRunning);
        }
        let mut feed = self.store.subscribe_commits();
        self.task = Some(tokio::spawn(async move {
            while let Some(row) = feed.recv().await {
                let action = match row.action {
                    RowAction::Insert => Operation::Created,
                    RowAction::Update => Operation::Updated,
                    RowAction::Delete => Operation::Removed,
                };
                let event = HookEvent {
                    action,
                    table: row.table,
                    entity: None,
                    database_entity: None,
                    entity_id: Some(EntityId::from(row.rowid)),
                };
                if ctx.emit(event.into()).await.is_err() {
                    debug!("engine queue closed, commit observer exiting");
                    return;
                }
            }
            warn!("commit feed closed");
            ctx.report(SyncError::Transport("commit feed closed".into()));
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}
