//! Snapshot observation of a document collection.
//!
//! The first snapshot after every (re)start lists the whole collection. Only
//! documents modified at or after the moment the observer started are
//! emitted from it, so a restart neither replays the collection nor misses
//! writes that raced the subscription. Documents without any timestamp are
//! emitted. Later snapshots are emitted unfiltered.

use super::{Notification, ObserverContext, SourceObserver};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vaultsync_storage::{ChangeKind, DocumentChange, DocumentSource, Snapshot};
use vaultsync_types::{EntityId, Operation};

/// Observer subscribed to one [`DocumentSource`].
pub struct SnapshotObserver {
    source: Arc<dyn DocumentSource>,
    table: String,
    task: Option<JoinHandle<()>>,
}

impl SnapshotObserver {
    /// The table name is the last segment of the collection path.
    #[must_use]
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        let table = collection_table(source.path()).to_string();
        Self {
            source,
            table,
            task: None,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Last segment of a collection path (`chats/abc/messages` → `messages`).
#[must_use]
pub fn collection_table(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Changes of the first snapshot that should be emitted.
#[must_use]
pub fn filter_startup(
    changes: Vec<DocumentChange>,
    started_at: DateTime<Utc>,
) -> Vec<DocumentChange> {
    changes
        .into_iter()
        .filter(|change| {
            change
                .document
                .modified_at()
                .is_none_or(|modified| modified >= started_at)
        })
        .collect()
}

fn to_notification(table: &str, change: DocumentChange) -> Option<Notification> {
    let DocumentChange { kind, document } = change;
    let id = match EntityId::parse(&document.id) {
        Ok(id) => id,
        Err(_) => {
            warn!(table, "document without a usable id skipped");
            return None;
        }
    };
    let operation = match kind {
        ChangeKind::Added => Operation::Created,
        ChangeKind::Modified => Operation::Updated,
        ChangeKind::Removed => return Some(Notification::bare(Operation::Removed, table, id)),
    };
    let mut record = document.data;
    record.insert("id".into(), Value::String(id.to_string()));
    Some(Notification::full(operation, table, id, record))
}

async fn forward(
    ctx: &ObserverContext,
    table: &str,
    snapshot: Snapshot,
    first: bool,
    started_at: DateTime<Utc>,
) -> bool {
    let changes = if first {
        let total = snapshot.changes.len();
        let kept = filter_startup(snapshot.changes, started_at);
        debug!(table, total, kept = kept.len(), "first snapshot filtered");
        kept
    } else {
        snapshot.changes
    };
    for change in changes {
        if let Some(notification) = to_notification(table, change) {
            if ctx.emit(notification).await.is_err() {
                return false;
            }
        }
    }
    true
}

#[async_trait]
impl SourceObserver for SnapshotObserver {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn start(&mut self, ctx: ObserverContext) -> SyncResult<()> {
        if self.is_running() {
            return Err(SyncError::AlreadyRunning);
        }
        let started_at = Utc::now();
        let mut stream = self.source.subscribe()?;
        let table = self.table.clone();

        self.task = Some(tokio::spawn(async move {
            while let Some(item) = stream.recv().await {
                match item {
                    Ok(snapshot) => {
                        let first = ctx.mark_notified();
                        if !forward(&ctx, &table, snapshot, first, started_at).await {
                            debug!(table = %table, "engine queue closed, snapshot observer exiting");
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(table = %table, error = %e, "snapshot subscription failed");
                        ctx.report(SyncError::Transport(e.to_string()));
                        return;
                    }
                }
            }
            ctx.report(SyncError::Transport(format!("{table} subscription closed")));
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
