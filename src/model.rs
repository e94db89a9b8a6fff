//! Core data model.
//!
//! An envelope is one unit of work routed through the bus. It lives as a
//! relational row (routing and queue-control columns) plus the full caller
//! document serialized alongside it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The one supported envelope format.
pub const BUS_SCHEMA_ID: &str = "2PLT_BUS/v1";

/// The one supported message format.
pub const MESSAGE_SCHEMA_ID: &str = "2PLT_MESSAGE/v1";

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

/// Stored queue state. Serialized as its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum QState {
    /// Waiting for (or held by) a claimant. Code 0.
    Pending,
    /// Finished successfully. Code 1. Terminal.
    Done,
    /// Given up on. Code 9. Terminal.
    Dead,
}

impl QState {
    pub fn code(self) -> i64 {
        match self {
            QState::Pending => 0,
            QState::Done => 1,
            QState::Dead => 9,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(QState::Pending),
            1 => Some(QState::Done),
            9 => Some(QState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QState::Done | QState::Dead)
    }

    /// Parse a requested terminal state from caller input.
    ///
    /// Accepts the numeric codes 1 and 9, their string forms, and the names
    /// `DONE` / `DEAD`. Everything else (including 0) is `invalid_q_state`.
    pub fn parse_terminal(value: &Value) -> Result<Self> {
        let invalid = || Error::InvalidQState {
            q_state: value.clone(),
        };
        let code = match value {
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => f as i64,
                _ => return Err(invalid()),
            },
            Value::String(s) => match s.trim() {
                "DONE" | "done" => 1,
                "DEAD" | "dead" => 9,
                other => other.parse::<i64>().map_err(|_| invalid())?,
            },
            _ => return Err(invalid()),
        };
        match QState::from_code(code) {
            Some(q) if q.is_terminal() => Ok(q),
            _ => Err(invalid()),
        }
    }
}

impl From<QState> for i64 {
    fn from(q: QState) -> i64 {
        q.code()
    }
}

impl TryFrom<i64> for QState {
    type Error = String;

    fn try_from(code: i64) -> std::result::Result<Self, Self::Error> {
        QState::from_code(code).ok_or_else(|| format!("unknown q_state code: {code}"))
    }
}

impl std::fmt::Display for QState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QState::Pending => "PENDING",
            QState::Done => "DONE",
            QState::Dead => "DEAD",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle position derived from the queue-control columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Pending,
    Claimed,
    Done,
    Dead,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Pending => "pending",
            Lifecycle::Claimed => "claimed",
            Lifecycle::Done => "done",
            Lifecycle::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Message type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    Request,
    Response,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Request => "REQUEST",
            MsgType::Response => "RESPONSE",
        }
    }
}

impl std::str::FromStr for MsgType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "REQUEST" => Ok(MsgType::Request),
            "RESPONSE" => Ok(MsgType::Response),
            _ => Err(Error::InvalidMsgType),
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The relational projection of a validated envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRecord {
    pub schema_id: String,
    pub bus_id: String,
    /// Normalized to whole seconds since the epoch.
    pub bus_ts: i64,
    pub from_owner_id: String,
    pub to_owner_id: String,
    pub message_schema_id: String,
    pub msg_type: MsgType,
    pub op_id: String,
    pub flow_owner_id: String,
    pub lane_id: String,
    pub request_id: String,
    pub in_state: String,
    /// RESPONSE only.
    pub state: Option<String>,
    /// RESPONSE only; always equal to `state`.
    pub out_state: Option<String>,
}

/// A validated envelope ready for insertion.
///
/// `record` holds the typed columns; `document` is the caller's object
/// (deep-copied, key order preserved) with normalization applied and the
/// queue-control fields reset.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub record: BusRecord,
    pub document: Map<String, Value>,
}

impl Envelope {
    /// Serialized form stored in `bus_json`.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.document)
            .map_err(|e| Error::Other(format!("failed to serialize envelope: {e}")))
    }
}

/// The engine-owned fields mirrored into the serialized envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueControl {
    pub q_state: QState,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub done_at: Option<i64>,
}

impl QueueControl {
    /// Control fields of a freshly enqueued envelope.
    pub fn pending() -> Self {
        Self {
            q_state: QState::Pending,
            claimed_by: None,
            claimed_at: None,
            done_at: None,
        }
    }

    /// The mirrored keys and their JSON values.
    fn mirrored(&self) -> [(&'static str, Value); 4] {
        [
            ("q_state", Value::from(self.q_state.code())),
            (
                "claimed_by",
                self.claimed_by.clone().map_or(Value::Null, Value::from),
            ),
            ("claimed_at", self.claimed_at.map_or(Value::Null, Value::from)),
            ("done_at", self.done_at.map_or(Value::Null, Value::from)),
        ]
    }

    /// Overwrite the mirrored keys on a serialized envelope object.
    pub fn apply_to(&self, doc: &mut Map<String, Value>) {
        for (key, value) in self.mirrored() {
            doc.insert(key.into(), value);
        }
    }

    /// Does every mirrored key of `doc` hold exactly these values?
    /// A missing key, or one of the wrong JSON type, does not match.
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        self.mirrored()
            .iter()
            .all(|(key, value)| doc.get(*key) == Some(value))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.q_state {
            QState::Done => Lifecycle::Done,
            QState::Dead => Lifecycle::Dead,
            QState::Pending if self.claimed_by.is_some() => Lifecycle::Claimed,
            QState::Pending => Lifecycle::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Stored row
// ---------------------------------------------------------------------------

/// A full `bus_messages` row as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRow {
    pub schema_id: String,
    pub bus_id: String,
    pub bus_ts: i64,
    pub q_state: QState,
    pub from_owner_id: String,
    pub to_owner_id: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub done_at: Option<i64>,
    pub message_schema_id: String,
    pub msg_type: MsgType,
    pub op_id: String,
    pub flow_owner_id: String,
    pub lane_id: String,
    pub request_id: String,
    pub in_state: String,
    pub state: Option<String>,
    pub out_state: Option<String>,
    pub bus_json: String,
    /// Insertion time in epoch milliseconds.
    pub inserted_at: i64,
}

impl BusRow {
    pub fn control(&self) -> QueueControl {
        QueueControl {
            q_state: self.q_state,
            claimed_by: self.claimed_by.clone(),
            claimed_at: self.claimed_at,
            done_at: self.done_at,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.control().lifecycle()
    }

    /// Parse the stored envelope, unwrapping one level of string encoding.
    /// Returns `None` when it is not a JSON object.
    pub fn parse_envelope(&self) -> Option<Map<String, Value>> {
        parse_stored_envelope(&self.bus_json).ok()
    }
}

/// Parse a stored `bus_json` value into an object.
pub(crate) fn parse_stored_envelope(raw: &str) -> std::result::Result<Map<String, Value>, String> {
    let mut value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    if let Value::String(inner) = &value {
        value = serde_json::from_str(inner).map_err(|e| e.to_string())?;
    }
    match value {
        Value::Object(map) => Ok(map),
        _ => Err("bus_json is not an object".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Outcome of inserting an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub bus_id: String,
    /// True when a row with this `bus_id` already existed.
    pub duplicate: bool,
    pub bus_ts: i64,
    pub q_state: QState,
}

/// How the serialized copy was (or failed to be) brought in line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    SqlJsonSet,
    ReadModifyWrite,
}

/// Result of a mirror patch. Never surfaced as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub ok: bool,
    pub method: SyncMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A successful claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEnvelope {
    /// The relational row; authoritative.
    pub row: BusRow,
    /// Parsed envelope with the claim fields overlaid, if it parses.
    pub envelope: Option<Map<String, Value>>,
    pub sync: SyncReport,
}

/// A completed finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub bus_id: String,
    pub q_state: QState,
    pub done_at: i64,
    pub sync: SyncReport,
}

/// Which claim protocol the store is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimStrategy {
    /// Single `UPDATE … RETURNING`; falls back to two-step if it errors.
    #[default]
    Returning,
    /// Select, conditional update, re-read; bounded retry.
    TwoStep,
}

impl ClaimStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStrategy::Returning => "returning",
            ClaimStrategy::TwoStep => "two_step",
        }
    }
}

impl std::str::FromStr for ClaimStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "returning" => Ok(ClaimStrategy::Returning),
            "two_step" => Ok(ClaimStrategy::TwoStep),
            other => Err(Error::Config(format!("unknown claim strategy: {other}"))),
        }
    }
}
