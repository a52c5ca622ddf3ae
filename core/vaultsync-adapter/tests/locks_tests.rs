use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vaultsync_adapter::{LockedIds, DEFAULT_LOCK_TTL};
use vaultsync_storage::MemoryRecordStore;
use vaultsync_sync::dispatcher::mock::RecordingSink;
use vaultsync_sync::observer::commit_hook::HookObserver;
use vaultsync_sync::{
    Engine, EntityKindSpec, EntityRegistry, LockSet, RegistrySpec, SupervisorState,
};

// ── Lock set ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn lock_expires_after_ttl() {
    let locks = LockedIds::default();
    assert_eq!(locks.ttl(), DEFAULT_LOCK_TTL);
    locks.lock("w3id-1");
    assert!(locks.is_locked("w3id-1"));

    tokio::time::advance(Duration::from_millis(14_900)).await;
    assert!(locks.contains("w3id-1"));
    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(!locks.contains("w3id-1"));
    assert!(locks.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn relocking_extends_the_lock() {
    let locks = LockedIds::new(Duration::from_secs(10));
    locks.lock("a");
    tokio::time::advance(Duration::from_secs(8)).await;
    locks.lock("a");
    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(locks.contains("a"));
}

#[tokio::test(start_paused = true)]
async fn unlock_releases_early() {
    let locks = LockedIds::default();
    locks.lock("a");
    locks.lock("b");
    assert!(locks.unlock("a"));
    assert!(!locks.unlock("a"));
    assert_eq!(locks.snapshot(), vec!["b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn clones_share_the_set() {
    let locks = LockedIds::default();
    let view = locks.clone();
    locks.lock("a");
    assert!(view.contains("a"));
}

// ── Engine integration ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn locked_id_is_delivered_once_lock_expires() {
    let spec = RegistrySpec {
        entities: vec![EntityKindSpec {
            name: "User".into(),
            table: "users".into(),
            relations: Vec::new(),
            consistency_delay_ms: None,
            forward_filter: None,
        }],
        ..RegistrySpec::default()
    };
    let registry = EntityRegistry::from_spec(spec, Duration::from_secs(3)).unwrap();
    let locks = LockedIds::default();
    let sink = RecordingSink::new();
    let engine = Engine::builder(registry, Arc::new(MemoryRecordStore::default()), sink.clone())
        .locks(Arc::new(locks.clone()))
        .build();
    let (observer, hooks) = HookObserver::new();
    engine.start(Box::new(observer)).unwrap();
    let mut state = engine.subscribe_state().unwrap();
    state.wait_for(|s| *s == SupervisorState::Running).await.unwrap();

    let user = json!({ "id": "u1", "name": "Ada" }).as_object().unwrap().clone();
    locks.lock("u1");
    hooks.after_insert("users", user.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.call_count(), 0);

    tokio::time::sleep(DEFAULT_LOCK_TTL).await;
    hooks.after_insert("users", user).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.call_count(), 1);
    engine.stop().await;
}
