//! Envelope validation: required fields, schema checks, normalization.

use busq::model::{MsgType, QState};
use busq::validate::validate_envelope;
use serde_json::{Value, json};

fn envelope() -> Value {
    json!({
        "schema_id": "2PLT_BUS/v1",
        "bus_id": "b-1",
        "bus_ts": "2024-01-01T00:00:00Z",
        "routing": { "from_owner_id": "planner", "to_owner_id": "worker" },
        "message": {
            "schema_id": "2PLT_MESSAGE/v1",
            "msg_type": "REQUEST",
            "op_id": 7,
            "flow": { "owner_id": "worker", "lane_id": "lane-a" },
            "request_id": "req-1",
            "in_state": "NEW",
            "zeta": 1,
            "alpha": 2
        },
        "custom": [1, 2, 3]
    })
}

#[test]
fn valid_request_projects_columns() {
    let env = validate_envelope(&envelope()).unwrap();
    let r = &env.record;
    assert_eq!(r.bus_id, "b-1");
    assert_eq!(r.bus_ts, 1_704_067_200);
    assert_eq!(r.msg_type, MsgType::Request);
    assert_eq!(r.op_id, "7");
    assert_eq!(r.lane_id, "lane-a");
    assert!(r.state.is_none());
    assert!(r.out_state.is_none());
}

#[test]
fn caller_fields_survive_in_order() {
    let env = validate_envelope(&envelope()).unwrap();
    let message_keys: Vec<&str> = env.document["message"]
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        message_keys,
        vec![
            "schema_id",
            "msg_type",
            "op_id",
            "flow",
            "request_id",
            "in_state",
            "zeta",
            "alpha"
        ]
    );
    assert_eq!(env.document["custom"], json!([1, 2, 3]));
    assert_eq!(env.document["bus_ts"], "2024-01-01T00:00:00Z");
}

#[test]
fn input_is_not_modified() {
    let mut body = envelope();
    body["message"]["state"] = json!("X");
    let before = body.clone();

    let env = validate_envelope(&body).unwrap();
    assert_eq!(body, before);
    assert!(env.document["message"].get("state").is_none());
}

#[test]
fn caller_queue_control_is_reset() {
    let mut body = envelope();
    body["q_state"] = json!(1);
    body["claimed_by"] = json!("impostor");
    body["done_at"] = json!(5);

    let env = validate_envelope(&body).unwrap();
    assert_eq!(env.document["q_state"], QState::Pending.code());
    assert_eq!(env.document["claimed_by"], Value::Null);
    assert_eq!(env.document["claimed_at"], Value::Null);
    assert_eq!(env.document["done_at"], Value::Null);
}

#[test]
fn every_missing_path_is_reported() {
    let body = json!({
        "schema_id": "2PLT_BUS/v1",
        "bus_id": "",
        "routing": { "from_owner_id": "planner" },
        "message": { "schema_id": "2PLT_MESSAGE/v1", "msg_type": "REQUEST", "flow": null }
    });
    let err = validate_envelope(&body).unwrap_err();
    assert_eq!(err.code(), "missing_fields");
    assert_eq!(
        err.details().unwrap()["missing"],
        json!([
            "bus_id",
            "bus_ts",
            "routing.to_owner_id",
            "message.op_id",
            "message.flow.owner_id",
            "message.flow.lane_id",
            "message.request_id",
            "message.in_state"
        ])
    );
}

#[test]
fn non_object_body_is_invalid() {
    for body in [json!([1]), json!("text"), json!(null)] {
        assert_eq!(validate_envelope(&body).unwrap_err().code(), "invalid_body");
    }
}

#[test]
fn wrong_schema_ids_are_rejected() {
    let mut body = envelope();
    body["schema_id"] = json!("2PLT_BUS/v2");
    assert_eq!(validate_envelope(&body).unwrap_err().code(), "invalid_schema_id");

    let mut body = envelope();
    body["message"]["schema_id"] = json!("OTHER");
    assert_eq!(
        validate_envelope(&body).unwrap_err().code(),
        "invalid_message_schema_id"
    );
}

#[test]
fn unknown_msg_type_is_rejected() {
    let mut body = envelope();
    body["message"]["msg_type"] = json!("request");
    assert_eq!(validate_envelope(&body).unwrap_err().code(), "invalid_msg_type");
}

#[test]
fn unparseable_bus_ts_is_rejected() {
    let mut body = envelope();
    body["bus_ts"] = json!("next tuesday");
    let err = validate_envelope(&body).unwrap_err();
    assert_eq!(err.code(), "invalid_bus_ts");
    assert!(err.is_validation());
}

#[test]
fn response_keeps_explicit_matching_out_state() {
    let mut body = envelope();
    body["message"]["msg_type"] = json!("RESPONSE");
    body["message"]["state"] = json!("DONE");
    body["message"]["out_state"] = json!("DONE");
    body["message"]["flow"]["owner_id"] = json!("elsewhere");

    let env = validate_envelope(&body).unwrap();
    assert_eq!(env.record.state.as_deref(), Some("DONE"));
    assert_eq!(env.record.out_state.as_deref(), Some("DONE"));
    assert_eq!(env.record.flow_owner_id, "elsewhere");
}
