//! Envelope validation and normalization.
//!
//! Only the fields the store needs are checked. Everything else the caller
//! sends is kept, in order, in the serialized copy.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{
    BUS_SCHEMA_ID, BusRecord, Envelope, MESSAGE_SCHEMA_ID, MsgType, QState, QueueControl,
};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Timestamps at or above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// Paths every envelope must carry, in the order they are reported.
const REQUIRED_PATHS: &[&str] = &[
    "schema_id",
    "bus_id",
    "bus_ts",
    "routing.from_owner_id",
    "routing.to_owner_id",
    "message.schema_id",
    "message.msg_type",
    "message.op_id",
    "message.flow.owner_id",
    "message.flow.lane_id",
    "message.request_id",
    "message.in_state",
];

/// Parse a raw request body into JSON.
///
/// Strips a leading BOM, and tolerates one level of string encoding
/// (`"{\"a\":1}"`) since some shells quote bodies that way.
pub fn parse_body(raw: &str) -> Result<Value> {
    let text = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    if text.is_empty() {
        return Err(Error::EmptyBody);
    }
    if text.len() > MAX_BODY_BYTES {
        return Err(Error::BodyTooLarge {
            max_bytes: MAX_BODY_BYTES,
        });
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(value @ Value::Object(_)) => Ok(value),
            _ => Ok(Value::String(inner)),
        },
        Ok(value) => Ok(value),
        Err(_) => Err(Error::InvalidJson),
    }
}

/// Look up a dotted path through nested objects.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |cur, key| cur.as_object()?.get(key))
}

/// True when a field counts as absent: missing, `null`, or `""`.
fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Every path in `paths` that is blank in `value`.
pub fn missing_paths(value: &Value, paths: &[&str]) -> Vec<String> {
    paths
        .iter()
        .filter(|p| is_blank(get_path(value, p)))
        .map(|p| p.to_string())
        .collect()
}

fn require(value: &Value, paths: &[&str]) -> Result<()> {
    let missing = missing_paths(value, paths);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::MissingFields {
            missing,
            searched: None,
        })
    }
}

/// Render a scalar as column text. Strings pass through unquoted.
pub fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_at(value: &Value, path: &str) -> String {
    get_path(value, path).map(text).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

fn seconds_from_int(n: i64) -> i64 {
    if n >= MILLIS_THRESHOLD { n.div_euclid(1000) } else { n }
}

fn seconds_from_float(f: f64) -> Result<i64> {
    if !f.is_finite() {
        return Err(Error::InvalidBusTs("bus_ts is not a valid number".into()));
    }
    let secs = if f >= MILLIS_THRESHOLD as f64 {
        (f / 1000.0).floor()
    } else {
        f.floor()
    };
    if secs < i64::MIN as f64 || secs >= i64::MAX as f64 {
        return Err(Error::InvalidBusTs("bus_ts is out of range".into()));
    }
    Ok(secs as i64)
}

fn seconds_from_date(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    // Zone-less forms are read as UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp())
}

/// Normalize a caller-supplied `bus_ts` to whole epoch seconds.
///
/// Accepts seconds or milliseconds as a number or digit string, or a
/// calendar date/time string.
pub fn normalize_bus_ts(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(seconds_from_int(i)),
            None => seconds_from_float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return Err(Error::InvalidBusTs("bus_ts is empty".into()));
            }
            if t.bytes().all(|b| b.is_ascii_digit()) {
                return match t.parse::<i64>() {
                    Ok(i) => Ok(seconds_from_int(i)),
                    Err(_) => seconds_from_float(t.parse::<f64>().unwrap_or(f64::NAN)),
                };
            }
            seconds_from_date(t).ok_or_else(|| {
                Error::InvalidBusTs("bus_ts is not a valid ISO-8601 datetime".into())
            })
        }
        _ => Err(Error::InvalidBusTs(
            "bus_ts must be number or string".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Validate and normalize an inbound envelope.
///
/// The input is never modified; the returned document is a normalized
/// copy with the queue-control fields reset to their pending values.
pub fn validate_envelope(body: &Value) -> Result<Envelope> {
    let Value::Object(original) = body else {
        return Err(Error::InvalidBody);
    };

    require(body, REQUIRED_PATHS)?;

    let schema_id = text_at(body, "schema_id");
    if schema_id != BUS_SCHEMA_ID {
        return Err(Error::InvalidSchemaId {
            expected: BUS_SCHEMA_ID,
        });
    }

    let bus_id = text_at(body, "bus_id");
    let bus_ts = normalize_bus_ts(&body["bus_ts"])?;
    let from_owner_id = text_at(body, "routing.from_owner_id");
    let to_owner_id = text_at(body, "routing.to_owner_id");

    let message_schema_id = text_at(body, "message.schema_id");
    if message_schema_id != MESSAGE_SCHEMA_ID {
        return Err(Error::InvalidMessageSchemaId {
            expected: MESSAGE_SCHEMA_ID,
        });
    }

    let msg_type: MsgType = text_at(body, "message.msg_type").parse()?;
    let op_id = text_at(body, "message.op_id");
    let flow_owner_id = text_at(body, "message.flow.owner_id");
    let lane_id = text_at(body, "message.flow.lane_id");
    let request_id = text_at(body, "message.request_id");
    let in_state = text_at(body, "message.in_state");

    let mut document = original.clone();
    let message = document
        .get_mut("message")
        .and_then(Value::as_object_mut)
        .ok_or(Error::InvalidBody)?;

    let (state, out_state) = match msg_type {
        MsgType::Request => {
            message.shift_remove("state");
            message.shift_remove("out_state");
            if to_owner_id != flow_owner_id {
                return Err(Error::RoutingFlowMismatch {
                    to_owner_id,
                    flow_owner_id,
                });
            }
            (None, None)
        }
        MsgType::Response => {
            require(body, &["message.state"])?;
            let state = text_at(body, "message.state");
            let out_state = match message.get("out_state") {
                None | Some(Value::Null) => {
                    message.insert("out_state".into(), Value::String(state.clone()));
                    state.clone()
                }
                Some(v) => text(v),
            };
            if out_state != state {
                return Err(Error::OutStateMismatch { state, out_state });
            }
            (Some(state), Some(out_state))
        }
    };

    QueueControl::pending().apply_to(&mut document);

    Ok(Envelope {
        record: BusRecord {
            schema_id,
            bus_id,
            bus_ts,
            from_owner_id,
            to_owner_id,
            message_schema_id,
            msg_type,
            op_id,
            flow_owner_id,
            lane_id,
            request_id,
            in_state,
            state,
            out_state,
        },
        document,
    })
}

// ---------------------------------------------------------------------------
// Finalize input
// ---------------------------------------------------------------------------

/// Locations searched for finalize inputs, in priority order. `$.row`
/// accepts the body of a dequeue response as-is.
const FINALIZE_SOURCES: &[&str] = &["$", "$.row"];

/// What a finalize request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeInput {
    pub bus_id: String,
    pub q_state: QState,
}

/// Extract `bus_id` and the terminal `q_state` from a flat body or a
/// `{ row: {...} }` wrapper. Each field is taken from the first source
/// that carries a non-null value for it.
pub fn finalize_input(body: &Value) -> Result<FinalizeInput> {
    let root = body.as_object().ok_or(Error::InvalidBody)?;
    let sources = [Some(root), root.get("row").and_then(Value::as_object)];
    let lookup = |key: &str| {
        sources
            .iter()
            .flatten()
            .find_map(|obj| obj.get(key).filter(|v| !v.is_null()))
    };

    let bus_id = lookup("bus_id");
    let q_state = lookup("q_state");

    let mut missing = Vec::new();
    if is_blank(bus_id) {
        missing.push("bus_id".to_string());
    }
    if is_blank(q_state) {
        missing.push("q_state".to_string());
    }
    match (bus_id, q_state) {
        (Some(bus_id), Some(q_state)) if missing.is_empty() => Ok(FinalizeInput {
            bus_id: text(bus_id),
            q_state: QState::parse_terminal(q_state)?,
        }),
        _ => Err(Error::MissingFields {
            missing,
            searched: Some(FINALIZE_SOURCES.iter().map(|s| s.to_string()).collect()),
        }),
    }
}
