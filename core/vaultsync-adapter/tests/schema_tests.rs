use pretty_assertions::assert_eq;
use serde_json::json;
use std::fs;
use vaultsync_adapter::{AdapterError, SchemaMapping, SchemaRegistry};
use vaultsync_types::TableName;

fn table(name: &str) -> TableName {
    TableName::raw(name).unwrap()
}

// ── Loading ──────────────────────────────────────────────────────

#[test]
fn loads_json_files_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("user.mapping.json"),
        json!({
            "tableName": "users",
            "schemaId": "schema-user",
            "ownerEnamePath": "ename",
            "localToUniversalMap": { "handle": "username" }
        })
        .to_string(),
    )
    .unwrap();
    fs::write(
        dir.path().join("message.mapping.json"),
        json!({ "tableName": "messages", "schemaId": "schema-message" }).to_string(),
    )
    .unwrap();
    fs::write(dir.path().join("README.md"), "not a mapping").unwrap();

    let registry = SchemaRegistry::load_dir(dir.path()).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.tables(), vec![&table("messages"), &table("users")]);

    let users = registry.get(&table("users")).unwrap();
    assert_eq!(users.schema_id, "schema-user");
    assert_eq!(users.owner_ename_path.as_deref(), Some("ename"));
    assert_eq!(users.local_to_universal_map["handle"], json!("username"));

    let messages = registry.get(&table("messages")).unwrap();
    assert!(messages.owner_ename_path.is_none());
    assert!(messages.local_to_universal_map.is_empty());
}

#[test]
fn malformed_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

    match SchemaRegistry::load_dir(dir.path()) {
        Err(AdapterError::Schema(message)) => assert!(message.contains("broken.json")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn missing_directory_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = SchemaRegistry::load_dir(dir.path().join("absent"));
    assert!(matches!(result, Err(AdapterError::Io(_))));
}

// ── Lookup ───────────────────────────────────────────────────────

#[test]
fn lookup_uses_routing_name() {
    let registry = SchemaRegistry::from_mappings([SchemaMapping {
        table_name: "Users".into(),
        schema_id: "schema-user".into(),
        owner_ename_path: None,
        local_to_universal_map: Default::default(),
    }])
    .unwrap();

    assert!(registry.contains(&TableName::pluralize("user").unwrap()));
    assert!(!registry.contains(&table("groups")));
}

#[test]
fn empty_schema_id_is_rejected() {
    let result = SchemaRegistry::from_mappings([SchemaMapping {
        table_name: "users".into(),
        schema_id: " ".into(),
        owner_ename_path: None,
        local_to_universal_map: Default::default(),
    }]);
    assert!(matches!(result, Err(AdapterError::Schema(_))));
}
