//! Change capture and sync engine for vaultsync.
//!
//! Observes a system of record, decides which changes are eligible for the
//! sink, enriches them with relations, and hands them over exactly once in
//! effect despite duplicate notifications, reconnects and the sink's own
//! writes echoing back.
//!
//! # Components
//!
//! - **Observer**: commit-hook or snapshot source of raw notifications
//! - **Supervisor**: start, health check, reconnect with backoff
//! - **Registry**: typed entity kinds resolved from table names
//! - **Junction**: association rows become parent updates
//! - **Scheduler**: deferred reload from committed state, coalescing
//! - **Guard**: dedup and echo suppression, atomic per id
//! - **Dispatcher**: one sink call per approved change, optional outbox
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vaultsync_storage::MemoryRecordStore;
//! use vaultsync_sync::dispatcher::mock::RecordingSink;
//! use vaultsync_sync::observer::commit_hook::HookObserver;
//! use vaultsync_sync::{Engine, EntityRegistry, RegistrySpec};
//!
//! # async fn run() -> vaultsync_sync::SyncResult<()> {
//! let registry = EntityRegistry::from_spec(RegistrySpec::default(), Default::default())?;
//! let engine = Engine::builder(
//!     registry,
//!     Arc::new(MemoryRecordStore::default()),
//!     RecordingSink::new(),
//! )
//! .build();
//!
//! let (observer, _hooks) = HookObserver::new();
//! engine.start(Box::new(observer))?;
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

mod config;
pub mod dispatcher;
mod engine;
mod entity;
mod error;
pub mod guard;
pub mod junction;
pub mod observer;
mod outbox;
pub mod scheduler;
pub mod supervisor;

pub use config::EngineConfig;
pub use dispatcher::{DispatchOutcome, Dispatcher, Sink};
pub use engine::{Engine, EngineBuilder, EngineStats, ReplayReport};
pub use entity::{
    EntityKind, EntityKindSpec, EntityRegistry, ForwardFilter, Junction, JunctionSpec,
    RegistrySpec, Resolved,
};
pub use error::{SyncError, SyncResult};
pub use guard::{
    check_and_claim, DedupRegistry, EchoGuard, GlobalIdLookup, GuardKey, LockSet, Verdict,
};
pub use observer::{Notification, ObserverContext, SourceObserver};
pub use outbox::{DeliveryOutbox, OutboxEntry};
pub use supervisor::{
    ReconnectPolicy, RetryPolicy, SupervisorHandle, SupervisorState, WatcherState,
};
