use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vaultsync_storage::{MemoryRecordStore, Relation, RelationMap, SqliteRecordStore};
use vaultsync_sync::dispatcher::mock::RecordingSink;
use vaultsync_sync::observer::commit_hook::{HookHandle, HookObserver, SqliteCommitObserver};
use vaultsync_sync::{
    DeliveryOutbox, Engine, EngineConfig, EntityKindSpec, EntityRegistry, ForwardFilter,
    GlobalIdLookup, JunctionSpec, LockSet, RegistrySpec, SupervisorState, SyncError, SyncResult,
};
use vaultsync_types::{EntityId, GlobalId, Operation, Record, TableName};

fn record(value: serde_json::Value) -> Record {
    value.as_object().unwrap().clone()
}

fn kind(name: &str, table: &str) -> EntityKindSpec {
    EntityKindSpec {
        name: name.into(),
        table: table.into(),
        relations: Vec::new(),
        consistency_delay_ms: None,
        forward_filter: None,
    }
}

fn registry() -> EntityRegistry {
    let spec = RegistrySpec {
        entities: vec![
            kind("User", "users"),
            EntityKindSpec {
                relations: vec!["participants".into()],
                ..kind("Group", "groups")
            },
            EntityKindSpec {
                forward_filter: Some(ForwardFilter::FieldContains {
                    field: "text".into(),
                    needle: "$$system-message$$".into(),
                }),
                ..kind("Message", "messages")
            },
        ],
        junctions: vec![JunctionSpec {
            table: "group_participants".into(),
            parent: "Group".into(),
            parent_id_field: "group_id".into(),
        }],
        ignored: vec!["sessions".into()],
    };
    EntityRegistry::from_spec(spec, Duration::from_secs(3)).unwrap()
}

fn store() -> Arc<MemoryRecordStore> {
    let mut relations = RelationMap::new();
    relations.declare(
        "groups",
        Relation::ManyToMany {
            name: "participants".into(),
            table: "users".into(),
            junction: "group_participants".into(),
            local_key: "group_id".into(),
            foreign_key: "user_id".into(),
        },
    );
    Arc::new(MemoryRecordStore::new(relations))
}

fn config() -> EngineConfig {
    EngineConfig {
        worker_count: 4,
        ..EngineConfig::default()
    }
}

struct Fixture {
    engine: Engine,
    store: Arc<MemoryRecordStore>,
    sink: Arc<RecordingSink>,
    hooks: HookHandle,
}

async fn running(engine: Engine, store: Arc<MemoryRecordStore>, sink: Arc<RecordingSink>) -> Fixture {
    let (observer, hooks) = HookObserver::new();
    engine.start(Box::new(observer)).unwrap();
    let mut state = engine.subscribe_state().unwrap();
    state.wait_for(|s| *s == SupervisorState::Running).await.unwrap();
    Fixture {
        engine,
        store,
        sink,
        hooks,
    }
}

async fn fixture() -> Fixture {
    let store = store();
    let sink = RecordingSink::new();
    let engine = Engine::builder(registry(), store.clone(), sink.clone())
        .config(config())
        .build();
    running(engine, store, sink).await
}

/// Lets queued work finish; with a paused clock this also advances time.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ── Delivery ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn insert_is_delivered_with_flattened_payload() {
    let f = fixture().await;
    f.hooks
        .after_insert("users", record(json!({ "id": "u1", "name": "Ada", "_version": 3 })))
        .await;
    settle(50).await;

    let calls = f.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].operation, Operation::Created);
    assert_eq!(calls[0].table_name, TableName::pluralize("user").unwrap());
    assert_eq!(calls[0].sink_data(), record(json!({ "id": "u1", "name": "Ada" })));

    let stats = f.engine.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.supervisor_state, SupervisorState::Running);
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_notification_is_delivered_once() {
    let f = fixture().await;
    let user = record(json!({ "id": "u1", "name": "Ada" }));
    f.hooks.after_insert("users", user.clone()).await;
    settle(50).await;
    f.hooks.after_insert("users", user).await;
    settle(50).await;

    assert_eq!(f.sink.call_count(), 1);
    assert_eq!(f.engine.stats().dropped, 1);
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicates_are_held_while_in_flight() {
    let f = fixture().await;
    f.sink.set_latency(Some(Duration::from_secs(1)));
    let user = record(json!({ "id": "u1", "name": "Ada" }));
    f.hooks.after_insert("users", user.clone()).await;
    f.hooks.after_insert("users", user).await;
    settle(2_000).await;

    assert_eq!(f.sink.call_count(), 1);
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn same_id_is_delivered_again_after_ttl() {
    let f = fixture().await;
    let user = record(json!({ "id": "u1", "name": "Ada" }));
    f.hooks.after_insert("users", user.clone()).await;
    settle(50).await;

    settle(5_100).await;
    assert_eq!(f.engine.stats().processed, 0);
    f.hooks.after_insert("users", user).await;
    settle(50).await;

    assert_eq!(f.sink.call_count(), 2);
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_is_not_remembered() {
    let f = fixture().await;
    f.sink.set_failing(true);
    let user = record(json!({ "id": "u1", "name": "Ada" }));
    f.hooks.after_insert("users", user.clone()).await;
    settle(50).await;

    f.sink.set_failing(false);
    f.hooks.after_insert("users", user).await;
    settle(50).await;

    let stats = f.engine.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(f.sink.call_count(), 2);
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn clear_processed_forgets_delivered_ids() {
    let f = fixture().await;
    let user = record(json!({ "id": "u1", "name": "Ada" }));
    f.hooks.after_insert("users", user.clone()).await;
    settle(50).await;

    assert_eq!(f.engine.clear_processed(), 1);
    f.hooks.after_insert("users", user).await;
    settle(50).await;
    assert_eq!(f.sink.call_count(), 2);
    f.engine.stop().await;
}

// ── Reload ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn partial_update_is_reloaded_after_delay() {
    let f = fixture().await;
    f.store.upsert("users", record(json!({ "id": "u1", "name": "Bea", "email": "bea@example.com" })));
    f.hooks
        .after_update("users", record(json!({ "id": "u1", "name": "Bea" })), None)
        .await;

    settle(2_900).await;
    assert_eq!(f.sink.call_count(), 0);
    assert_eq!(f.engine.stats().pending_reloads, 1);

    settle(200).await;
    let calls = f.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].operation, Operation::Updated);
    assert_eq!(calls[0].sink_data()["email"], json!("bea@example.com"));
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_updates_is_coalesced() {
    let f = fixture().await;
    f.store.upsert("users", record(json!({ "id": "u1", "name": "Cy" })));
    for name in ["Ada", "Bea", "Cy"] {
        f.hooks
            .after_update("users", record(json!({ "id": "u1", "name": name })), None)
            .await;
        settle(100).await;
    }
    settle(3_500).await;

    let calls = f.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].sink_data()["name"], json!("Cy"));
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn vanished_entity_is_dropped() {
    let f = fixture().await;
    f.hooks
        .after_update("users", record(json!({ "id": "ghost", "name": "?" })), None)
        .await;
    settle(3_500).await;

    assert_eq!(f.sink.call_count(), 0);
    assert_eq!(f.engine.stats().dropped, 1);
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn update_without_id_is_resolved_by_fields() {
    let f = fixture().await;
    f.store.upsert("users", record(json!({ "id": "u7", "email": "ada@example.com" })));
    f.hooks
        .after_update("users", record(json!({ "email": "ada@example.com" })), None)
        .await;
    settle(3_500).await;

    let calls = f.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entity_id, EntityId::parse("u7").unwrap());
    f.engine.stop().await;
}

// ── Removal ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn removal_evicts_so_recreation_is_delivered() {
    let f = fixture().await;
    let user = record(json!({ "id": "u1", "name": "Ada" }));
    f.hooks.after_insert("users", user.clone()).await;
    settle(50).await;
    f.hooks.after_remove("users", Some(EntityId::parse("u1").unwrap()), None).await;
    settle(50).await;
    f.hooks.after_insert("users", user).await;
    settle(50).await;

    let ops: Vec<Operation> = f.sink.calls().iter().map(|c| c.operation).collect();
    assert_eq!(ops, vec![Operation::Created, Operation::Removed, Operation::Created]);
    assert_eq!(f.sink.calls()[1].sink_data(), record(json!({ "id": "u1" })));
    f.engine.stop().await;
}

// ── Routing ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn membership_change_updates_parent_with_relations() {
    let f = fixture().await;
    f.store.upsert("users", record(json!({ "id": "u1", "name": "Ada" })));
    f.store.upsert("groups", record(json!({ "id": "g1", "name": "Council" })));
    f.store.upsert("group_participants", record(json!({ "group_id": "g1", "user_id": "u1" })));

    f.hooks
        .after_insert("group_participants", record(json!({ "group_id": "g1", "user_id": "u1" })))
        .await;
    settle(3_500).await;

    let calls = f.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].table_name, TableName::pluralize("group").unwrap());
    assert_eq!(calls[0].operation, Operation::Updated);
    assert_eq!(calls[0].entity_id, EntityId::parse("g1").unwrap());
    let data = calls[0].sink_data();
    assert_eq!(data["name"], json!("Council"));
    assert_eq!(data["participants"][0]["name"], json!("Ada"));
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn membership_removal_with_loaded_row_updates_parent() {
    let f = fixture().await;
    f.store.upsert("groups", record(json!({ "id": "g1", "name": "Council" })));

    f.hooks
        .after_remove(
            "group_participants",
            None,
            Some(record(json!({ "group_id": "g1", "user_id": "u1" }))),
        )
        .await;
    settle(3_500).await;

    let calls = f.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].table_name, TableName::pluralize("groups").unwrap());
    assert_eq!(calls[0].operation, Operation::Updated);
    assert_eq!(calls[0].entity_id, EntityId::parse("g1").unwrap());
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn forward_filter_drops_ordinary_messages() {
    let f = fixture().await;
    f.hooks
        .after_insert("messages", record(json!({ "id": "m1", "text": "hello" })))
        .await;
    f.hooks
        .after_insert("messages", record(json!({ "id": "m2", "text": "$$system-message$$ joined" })))
        .await;
    settle(50).await;

    let calls = f.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].entity_id, EntityId::parse("m2").unwrap());
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unsynced_tables_never_reach_sink() {
    let f = fixture().await;
    f.sink.reject_table("groups");
    f.hooks.after_insert("sessions", record(json!({ "id": "s1" }))).await;
    f.hooks.after_insert("audit_log", record(json!({ "id": "a1" }))).await;
    f.hooks.after_insert("groups", record(json!({ "id": "g1" }))).await;
    settle(3_500).await;

    assert_eq!(f.sink.call_count(), 0);
    assert_eq!(f.engine.stats().dropped, 3);
    f.engine.stop().await;
}

// ── Echo suppression ─────────────────────────────────────────────

#[derive(Default)]
struct SinkLocks(Mutex<HashSet<String>>);

impl LockSet for SinkLocks {
    fn is_locked(&self, id: &str) -> bool {
        self.0.lock().unwrap().contains(id)
    }
}

struct Mappings(HashMap<String, String>);

#[async_trait]
impl GlobalIdLookup for Mappings {
    async fn global_id(&self, local: &EntityId, _: &TableName) -> SyncResult<Option<GlobalId>> {
        Ok(self.0.get(local.as_str()).and_then(|g| GlobalId::new(g.clone())))
    }
}

#[tokio::test(start_paused = true)]
async fn sink_writes_do_not_echo_back() {
    let locks = Arc::new(SinkLocks::default());
    locks.0.lock().unwrap().insert("u1".into());
    locks.0.lock().unwrap().insert("w3id-2".into());
    let mappings = Mappings(HashMap::from([("u2".to_string(), "w3id-2".to_string())]));

    let store = store();
    let sink = RecordingSink::new();
    let engine = Engine::builder(registry(), store.clone(), sink.clone())
        .config(config())
        .locks(locks.clone())
        .global_ids(Arc::new(mappings))
        .build();
    let f = running(engine, store, sink).await;

    for id in ["u1", "u2", "u3"] {
        f.hooks.after_insert("users", record(json!({ "id": id }))).await;
    }
    settle(50).await;

    let delivered: Vec<String> = f.sink.calls().iter().map(|c| c.entity_id.to_string()).collect();
    assert_eq!(delivered, vec!["u3"]);

    // once the sink releases its lock the record flows normally
    locks.0.lock().unwrap().remove("u1");
    f.hooks.after_insert("users", record(json!({ "id": "u1" }))).await;
    settle(50).await;
    assert_eq!(f.sink.call_count(), 2);
    f.engine.stop().await;
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn start_twice_is_rejected() {
    let f = fixture().await;
    let (observer, _hooks) = HookObserver::new();
    assert!(matches!(
        f.engine.start(Box::new(observer)),
        Err(SyncError::AlreadyRunning)
    ));
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_cancels_reloads() {
    let f = fixture().await;
    f.store.upsert("users", record(json!({ "id": "u1", "name": "Ada" })));
    f.hooks
        .after_update("users", record(json!({ "id": "u1", "name": "Ada" })), None)
        .await;
    settle(50).await;
    assert_eq!(f.engine.stats().pending_reloads, 1);

    f.engine.stop().await;
    f.engine.stop().await;
    assert!(!f.engine.is_running());
    assert_eq!(f.engine.supervisor_state(), SupervisorState::Stopped);

    settle(10_000).await;
    assert_eq!(f.sink.call_count(), 0);
    assert!(!f.hooks.after_insert("users", record(json!({ "id": "u2" }))).await);
}

#[tokio::test(start_paused = true)]
async fn engine_can_restart_after_stop() {
    let f = fixture().await;
    f.engine.stop().await;

    let (observer, hooks) = HookObserver::new();
    f.engine.start(Box::new(observer)).unwrap();
    let mut state = f.engine.subscribe_state().unwrap();
    state.wait_for(|s| *s == SupervisorState::Running).await.unwrap();

    hooks.after_insert("users", record(json!({ "id": "u1" }))).await;
    settle(50).await;
    assert_eq!(f.sink.call_count(), 1);
    f.engine.stop().await;
}

// ── Outbox ───────────────────────────────────────────────────────

async fn with_outbox() -> (Fixture, DeliveryOutbox) {
    let outbox = DeliveryOutbox::open_in_memory().unwrap();
    let store = store();
    let sink = RecordingSink::new();
    let engine = Engine::builder(registry(), store.clone(), sink.clone())
        .config(config())
        .outbox(outbox.clone())
        .build();
    (running(engine, store, sink).await, outbox)
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_is_parked_and_replayed() {
    let (f, outbox) = with_outbox().await;
    f.sink.set_failing(true);
    f.hooks.after_insert("users", record(json!({ "id": "u1", "name": "Ada" }))).await;
    settle(50).await;
    assert_eq!(outbox.len().unwrap(), 1);

    let report = f.engine.replay_outbox().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(outbox.attempts("users", "u1").unwrap(), Some(2));

    f.sink.set_failing(false);
    let report = f.engine.replay_outbox().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(outbox.is_empty().unwrap());
    assert_eq!(f.engine.replay_outbox().await.unwrap().delivered, 0);
    assert_eq!(f.engine.stats().processed, 1);
    f.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn parked_change_superseded_by_newer_delivery() {
    let (f, outbox) = with_outbox().await;
    let user = record(json!({ "id": "u1", "name": "Ada" }));
    f.sink.set_failing(true);
    f.hooks.after_insert("users", user.clone()).await;
    settle(50).await;

    f.sink.set_failing(false);
    f.hooks.after_insert("users", user).await;
    settle(50).await;

    let report = f.engine.replay_outbox().await.unwrap();
    assert_eq!(report.superseded, 1);
    assert_eq!(report.delivered, 0);
    assert!(outbox.is_empty().unwrap());
    assert_eq!(f.sink.call_count(), 2);
    f.engine.stop().await;
}

// ── SQLite source ────────────────────────────────────────────────

async fn wait_for_calls(sink: &RecordingSink, n: usize) {
    for _ in 0..200 {
        if sink.call_count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn committed_rows_flow_from_sqlite() {
    let store = Arc::new(SqliteRecordStore::open_in_memory(RelationMap::new()).unwrap());
    store
        .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);")
        .unwrap();
    let spec = RegistrySpec {
        entities: vec![EntityKindSpec {
            consistency_delay_ms: Some(20),
            ..kind("User", "users")
        }],
        ..RegistrySpec::default()
    };
    let registry = EntityRegistry::from_spec(spec, Duration::ZERO).unwrap();
    let sink = RecordingSink::new();
    let engine = Engine::builder(registry, store.clone(), sink.clone())
        .config(EngineConfig {
            dedup_ttl_ms: 50,
            ..config()
        })
        .build();
    engine
        .start(Box::new(SqliteCommitObserver::new(Arc::clone(&store))))
        .unwrap();
    let mut state = engine.subscribe_state().unwrap();
    state.wait_for(|s| *s == SupervisorState::Running).await.unwrap();

    store
        .execute_batch(
            "BEGIN; INSERT INTO users (id, name) VALUES (1, 'ghost'); ROLLBACK;
             INSERT INTO users (id, name) VALUES (2, 'Ada');",
        )
        .unwrap();
    wait_for_calls(&sink, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    store
        .execute_batch("UPDATE users SET name = 'Bea' WHERE id = 2;")
        .unwrap();
    wait_for_calls(&sink, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].operation, Operation::Created);
    assert_eq!(calls[0].entity_id, EntityId::from(2));
    assert_eq!(calls[0].sink_data()["name"], json!("Ada"));
    assert_eq!(calls[1].operation, Operation::Updated);
    assert_eq!(calls[1].sink_data()["name"], json!("Bea"));
    engine.stop().await;
}

#[tokio::test]
async fn junction_rows_from_sqlite_update_parent() {
    let store = Arc::new(SqliteRecordStore::open_in_memory(RelationMap::new()).unwrap());
    store
        .execute_batch(
            "CREATE TABLE groups (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE group_participants (group_id INTEGER NOT NULL, user_id INTEGER NOT NULL);
             INSERT INTO groups (id, name) VALUES (7, 'Council');",
        )
        .unwrap();
    let spec = RegistrySpec {
        entities: vec![EntityKindSpec {
            consistency_delay_ms: Some(20),
            ..kind("Group", "groups")
        }],
        junctions: vec![JunctionSpec {
            table: "group_participants".into(),
            parent: "Group".into(),
            parent_id_field: "group_id".into(),
        }],
        ..RegistrySpec::default()
    };
    let registry = EntityRegistry::from_spec(spec, Duration::ZERO).unwrap();
    let sink = RecordingSink::new();
    let engine = Engine::builder(registry, store.clone(), sink.clone())
        .config(config())
        .build();
    engine
        .start(Box::new(SqliteCommitObserver::new(Arc::clone(&store))))
        .unwrap();
    let mut state = engine.subscribe_state().unwrap();
    state.wait_for(|s| *s == SupervisorState::Running).await.unwrap();

    store
        .execute_batch("INSERT INTO group_participants (group_id, user_id) VALUES (7, 1);")
        .unwrap();
    wait_for_calls(&sink, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let calls = sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].table_name, TableName::pluralize("groups").unwrap());
    assert_eq!(calls[0].operation, Operation::Updated);
    assert_eq!(calls[0].entity_id, EntityId::from(7));
    assert_eq!(calls[0].sink_data()["name"], json!("Council"));
    assert_eq!(engine.stats().dropped, 0);
    engine.stop().await;
}
