use pretty_assertions::assert_eq;
use serde_json::json;
use vaultsync_sync::DeliveryOutbox;
use vaultsync_types::{ChangeEvent, EntityId, Record, TableName};

fn user(name: &str) -> ChangeEvent {
    let record: Record = json!({ "id": "u1", "name": name }).as_object().unwrap().clone();
    ChangeEvent::updated(TableName::pluralize("users").unwrap(), &record).unwrap()
}

// ── Persistence ──────────────────────────────────────────────────

#[test]
fn parked_changes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");
    {
        let outbox = DeliveryOutbox::open(&path).unwrap();
        outbox.push(&user("Ada"), "sink responded 503").unwrap();
        outbox
            .push(
                &ChangeEvent::removed(
                    TableName::pluralize("groups").unwrap(),
                    EntityId::parse("g1").unwrap(),
                ),
                "network error",
            )
            .unwrap();
    }

    let outbox = DeliveryOutbox::open(&path).unwrap();
    let pending = outbox.pending(10).unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].event, user("Ada"));
    assert_eq!(pending[0].last_error, "sink responded 503");
    assert_eq!(pending[1].event.entity_id, EntityId::parse("g1").unwrap());
}

#[test]
fn repeated_failure_keeps_latest_change() {
    let dir = tempfile::tempdir().unwrap();
    let outbox = DeliveryOutbox::open(dir.path().join("outbox.db")).unwrap();
    outbox.push(&user("Ada"), "first").unwrap();
    outbox.push(&user("Bea"), "second").unwrap();

    let pending = outbox.pending(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event.sink_data()["name"], json!("Bea"));
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(outbox.attempts("users", "u1").unwrap(), Some(2));

    assert!(outbox.remove(pending[0].seq).unwrap());
    assert!(outbox.is_empty().unwrap());
}
