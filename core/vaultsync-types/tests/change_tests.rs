use pretty_assertions::assert_eq;
use serde_json::json;
use vaultsync_types::{ChangeEvent, EntityId, Operation, Record, TableName};

fn record(value: serde_json::Value) -> Record {
    value.as_object().unwrap().clone()
}

fn table(name: &str) -> TableName {
    TableName::pluralize(name).unwrap()
}

// ── Constructors ─────────────────────────────────────────────────

#[test]
fn created_carries_flattened_payload() {
    let raw = record(json!({
        "id": "m1",
        "text": "hello",
        "_version": 3,
        "sender": { "id": "u1", "_hash": "x" }
    }));
    let event = ChangeEvent::created(table("message"), &raw).unwrap();

    assert_eq!(event.operation, Operation::Created);
    assert_eq!(event.entity_id.as_str(), "m1");
    assert_eq!(event.table_name.as_str(), "messages");
    assert_eq!(
        event.payload.unwrap(),
        record(json!({ "id": "m1", "text": "hello", "sender": { "id": "u1" } }))
    );
}

#[test]
fn updated_requires_id() {
    let raw = record(json!({ "title": "no id here" }));
    assert!(ChangeEvent::updated(table("polls"), &raw).is_err());
}

#[test]
fn updated_rejects_empty_id() {
    let raw = record(json!({ "id": "", "title": "x" }));
    assert!(ChangeEvent::updated(table("polls"), &raw).is_err());
}

#[test]
fn id_resolved_through_aliases() {
    let raw = record(json!({ "_id": "doc-7", "name": "x" }));
    let event = ChangeEvent::created(table("chats"), &raw).unwrap();
    assert_eq!(event.entity_id.as_str(), "doc-7");
    // the private alias is stripped but the id stays visible to the sink
    assert_eq!(event.payload.unwrap()["id"], json!("doc-7"));
}

#[test]
fn integer_ids_become_strings() {
    let raw = record(json!({ "id": 12, "name": "x" }));
    let event = ChangeEvent::created(table("groups"), &raw).unwrap();
    assert_eq!(event.entity_id, EntityId::from(12));
}

#[test]
fn removed_has_no_payload() {
    let event = ChangeEvent::removed(table("votes"), EntityId::parse("v1").unwrap());
    assert_eq!(event.operation, Operation::Removed);
    assert!(event.payload.is_none());
    assert!(event.relations.is_empty());
}

// ── Sink data ────────────────────────────────────────────────────

#[test]
fn sink_data_merges_relations() {
    let raw = record(json!({ "id": "v1", "choice": 2, "pollId": "p1" }));
    let event = ChangeEvent::updated(table("votes"), &raw)
        .unwrap()
        .with_relation("poll", json!({ "id": "p1", "group": { "id": "g1", "_secret": 1 } }));

    let data = event.sink_data();
    assert_eq!(data["poll"], json!({ "id": "p1", "group": { "id": "g1" } }));
    assert_eq!(data["choice"], json!(2));
}

#[test]
fn sink_data_for_removal_is_id_only() {
    let event = ChangeEvent::removed(table("votes"), EntityId::parse("v1").unwrap());
    assert_eq!(event.sink_data(), record(json!({ "id": "v1" })));
}

#[test]
fn operation_serde_names() {
    assert_eq!(serde_json::to_string(&Operation::Created).unwrap(), r#""created""#);
    assert_eq!(serde_json::to_string(&Operation::Removed).unwrap(), r#""removed""#);
}

#[test]
fn change_event_serializes_camel_case() {
    let event = ChangeEvent::removed(table("votes"), EntityId::parse("v1").unwrap());
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(
        json,
        json!({ "entityId": "v1", "tableName": "votes", "operation": "removed" })
    );
}
