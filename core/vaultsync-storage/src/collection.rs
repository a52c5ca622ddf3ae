//! Document collections with real-time snapshot subscriptions.
//!
//! A subscriber first receives a snapshot listing every existing document
//! as `Added`, then one snapshot per write. Subscriptions end with an error
//! item when the collection drops them.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use vaultsync_types::Record;

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Record,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Last-modified time: `updated_at`, falling back to `created_at`.
    #[must_use]
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.created_at)
    }
}

/// How a document changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One document change inside a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// A batch of changes delivered together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub changes: Vec<DocumentChange>,
}

/// Receiving end of a snapshot subscription.
pub type SnapshotStream = mpsc::UnboundedReceiver<StorageResult<Snapshot>>;

/// A collection that can be observed through snapshots.
pub trait DocumentSource: Send + Sync {
    /// Collection path, e.g. `users` or `chats/abc/messages`.
    fn path(&self) -> &str;

    /// Opens a new snapshot subscription.
    fn subscribe(&self) -> StorageResult<SnapshotStream>;
}

#[derive(Default)]
struct CollectionState {
    documents: BTreeMap<String, Document>,
    subscribers: Vec<mpsc::UnboundedSender<StorageResult<Snapshot>>>,
    unavailable: Option<String>,
}

impl CollectionState {
    fn publish(&mut self, change: DocumentChange) {
        let snapshot = Snapshot { changes: vec![change] };
        self.subscribers
            .retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
    }
}

/// In-memory document collection.
pub struct MemoryCollection {
    path: String,
    state: Mutex<CollectionState>,
}

impl MemoryCollection {
    /// Creates an empty collection at `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, CollectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes a document, stamping `updated_at` (and `created_at` for new
    /// documents) with the current time.
    pub fn set(&self, id: impl Into<String>, data: Record) {
        let id = id.into();
        let now = Utc::now();
        let created_at = self
            .state()
            .documents
            .get(&id)
            .and_then(|d| d.created_at)
            .unwrap_or(now);
        self.set_with_times(id, data, Some(created_at), Some(now));
    }

    /// Writes a document with explicit timestamps.
    pub fn set_with_times(
        &self,
        id: impl Into<String>,
        data: Record,
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
    ) {
        let document = Document {
            id: id.into(),
            data,
            created_at,
            updated_at,
        };
        let mut state = self.state();
        let kind = if state.documents.contains_key(&document.id) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        state.documents.insert(document.id.clone(), document.clone());
        state.publish(DocumentChange { kind, document });
    }

    /// Merges `fields` into an existing document. Returns `false` if the
    /// document does not exist.
    pub fn update(&self, id: &str, fields: Record) -> bool {
        let Some(mut data) = self.get(id).map(|d| d.data) else {
            return false;
        };
        data.extend(fields);
        self.set(id, data);
        true
    }

    /// Deletes a document. Returns whether it existed.
    pub fn delete(&self, id: &str) -> bool {
        let mut state = self.state();
        match state.documents.remove(id) {
            Some(document) => {
                state.publish(DocumentChange {
                    kind: ChangeKind::Removed,
                    document,
                });
                true
            }
            None => false,
        }
    }

    /// Reads a document.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Document> {
        self.state().documents.get(id).cloned()
    }

    /// Ends every open subscription with a subscription error.
    pub fn fail_subscribers(&self, reason: &str) {
        let mut state = self.state();
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(Err(StorageError::Subscription(reason.to_string())));
        }
    }

    /// Makes new subscriptions fail (`Some`) or succeed again (`None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state().unavailable = reason.map(str::to_string);
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

impl DocumentSource for MemoryCollection {
    fn path(&self) -> &str {
        &self.path
    }

    fn subscribe(&self) -> StorageResult<SnapshotStream> {
        let mut state = self.state();
        if let Some(reason) = &state.unavailable {
            return Err(StorageError::Unavailable(reason.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = Snapshot {
            changes: state
                .documents
                .values()
                .map(|document| DocumentChange {
                    kind: ChangeKind::Added,
                    document: document.clone(),
                })
                .collect(),
        };
        let _ = tx.send(Ok(initial));
        state.subscribers.push(tx);
        Ok(rx)
    }
}
