use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde::Serialize;
use serde_json::json;
use vaultsync_types::{extract_id, flatten_record, flatten_value};

#[test]
fn strips_private_fields_at_every_depth() {
    let input = json!({
        "id": "1",
        "_internal": true,
        "members": [ { "id": "u1", "_token": "t" }, { "id": "u2" } ],
        "owner": { "profile": { "_cache": {}, "name": "Ann" } }
    });
    assert_eq!(
        flatten_value(&input),
        json!({
            "id": "1",
            "members": [ { "id": "u1" }, { "id": "u2" } ],
            "owner": { "profile": { "name": "Ann" } }
        })
    );
}

#[test]
fn scalars_pass_through() {
    assert_eq!(flatten_value(&json!(5)), json!(5));
    assert_eq!(flatten_value(&json!(null)), json!(null));
}

#[derive(Serialize)]
struct Poll {
    id: String,
    #[serde(rename = "createdAt")]
    created_at: chrono::DateTime<Utc>,
    #[serde(rename = "_dirty")]
    dirty: bool,
}

#[test]
fn flatten_record_serializes_dates_as_iso8601() {
    let poll = Poll {
        id: "p1".into(),
        created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        dirty: true,
    };
    let flat = flatten_record(&poll).unwrap();
    assert_eq!(flat["createdAt"], json!("2025-03-01T12:00:00Z"));
    assert!(!flat.contains_key("_dirty"));
}

#[test]
fn flatten_record_rejects_non_objects() {
    assert!(flatten_record(&vec![1, 2]).is_err());
}

#[test]
fn extract_id_alias_order() {
    let rec = json!({ "ID": "upper", "id": "lower" });
    assert_eq!(extract_id(rec.as_object().unwrap()).unwrap().as_str(), "lower");

    let rec = json!({ "Id": "mixed" });
    assert_eq!(extract_id(rec.as_object().unwrap()).unwrap().as_str(), "mixed");
}

#[test]
fn extract_id_skips_unusable_values() {
    let rec = json!({ "id": "", "_id": "fallback" });
    assert_eq!(extract_id(rec.as_object().unwrap()).unwrap().as_str(), "fallback");

    let rec = json!({ "id": { "nested": 1 } });
    assert!(extract_id(rec.as_object().unwrap()).is_none());
}
