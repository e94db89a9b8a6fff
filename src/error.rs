//! Error types for busq.
//!
//! Every error carries a machine-readable code, a human message (its
//! `Display`), optional structured details, and an HTTP-equivalent status
//! class for whatever transport sits in front of the engine.

use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request body is empty")]
    EmptyBody,

    #[error("request body is too large")]
    BodyTooLarge { max_bytes: usize },

    #[error("request body is not valid JSON")]
    InvalidJson,

    #[error("body must be a JSON object")]
    InvalidBody,

    #[error("missing required fields")]
    MissingFields {
        missing: Vec<String>,
        /// Candidate locations consulted, when the input may be wrapped.
        searched: Option<Vec<String>>,
    },

    #[error("schema_id must be {expected}")]
    InvalidSchemaId { expected: &'static str },

    #[error("message.schema_id must be {expected}")]
    InvalidMessageSchemaId { expected: &'static str },

    #[error("message.msg_type must be REQUEST or RESPONSE")]
    InvalidMsgType,

    #[error("{0}")]
    InvalidBusTs(String),

    #[error("routing.to_owner_id must match message.flow.owner_id for REQUEST")]
    RoutingFlowMismatch {
        to_owner_id: String,
        flow_owner_id: String,
    },

    #[error("message.out_state must equal message.state for RESPONSE")]
    OutStateMismatch { state: String, out_state: String },

    #[error("insert was ignored by a storage constraint: {bus_id}")]
    EnqueueIgnored { bus_id: String },

    #[error("owner_id is required")]
    MissingOwnerId,

    #[error("bus_id is required")]
    MissingBusId,

    #[error("q_state must be 1 (DONE) or 9 (DEAD)")]
    InvalidQState { q_state: Value },

    #[error("bus_id not found: {0}")]
    NotFound(String),

    #[error("claimed row not found after update: {0}")]
    InconsistentState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::EmptyBody => "empty_body",
            Error::BodyTooLarge { .. } => "body_too_large",
            Error::InvalidJson => "invalid_json",
            Error::InvalidBody => "invalid_body",
            Error::MissingFields { .. } => "missing_fields",
            Error::InvalidSchemaId { .. } => "invalid_schema_id",
            Error::InvalidMessageSchemaId { .. } => "invalid_message_schema_id",
            Error::InvalidMsgType => "invalid_msg_type",
            Error::InvalidBusTs(_) => "invalid_bus_ts",
            Error::RoutingFlowMismatch { .. } => "routing_flow_mismatch",
            Error::OutStateMismatch { .. } => "out_state_mismatch",
            Error::EnqueueIgnored { .. } => "enqueue_ignored",
            Error::MissingOwnerId => "missing_owner_id",
            Error::MissingBusId => "missing_bus_id",
            Error::InvalidQState { .. } => "invalid_q_state",
            Error::NotFound(_) => "not_found",
            Error::InconsistentState(_) => "inconsistent_state",
            Error::Config(_) => "config_error",
            Error::Storage(_) | Error::Migrate(_) => "storage_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Optional structured details for the error response.
    pub fn details(&self) -> Option<Value> {
        match self {
            Error::BodyTooLarge { max_bytes } => Some(json!({ "max_bytes": max_bytes })),
            Error::MissingFields { missing, searched } => Some(match searched {
                Some(searched) => json!({ "missing": missing, "searched": searched }),
                None => json!({ "missing": missing }),
            }),
            Error::RoutingFlowMismatch {
                to_owner_id,
                flow_owner_id,
            } => Some(json!({ "to_owner_id": to_owner_id, "flow_owner_id": flow_owner_id })),
            Error::OutStateMismatch { state, out_state } => {
                Some(json!({ "state": state, "out_state": out_state }))
            }
            Error::EnqueueIgnored { bus_id }
            | Error::NotFound(bus_id)
            | Error::InconsistentState(bus_id) => Some(json!({ "bus_id": bus_id })),
            Error::InvalidQState { q_state } => Some(json!({ "q_state": q_state })),
            _ => None,
        }
    }

    /// HTTP-equivalent status class.
    pub fn status(&self) -> u16 {
        match self {
            Error::BodyTooLarge { .. } => 413,
            Error::NotFound(_) => 404,
            Error::EnqueueIgnored { .. } => 409,
            Error::InconsistentState(_)
            | Error::Config(_)
            | Error::Storage(_)
            | Error::Migrate(_)
            | Error::Other(_) => 500,
            _ => 400,
        }
    }

    /// Is this a caller input error (never retried by the engine)?
    pub fn is_validation(&self) -> bool {
        self.status() == 400
    }

    /// The `{ok: false, error, message, details?}` response body.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "ok": false,
            "error": self.code(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            body["details"] = details;
        }
        body
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_body_lists_every_path() {
        let err = Error::MissingFields {
            missing: vec!["bus_id".into(), "routing.to_owner_id".into()],
            searched: None,
        };
        let body = err.to_body();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "missing_fields");
        assert_eq!(
            body["details"]["missing"],
            json!(["bus_id", "routing.to_owner_id"])
        );
        assert_eq!(err.status(), 400);
        assert!(err.is_validation());
    }

    #[test]
    fn not_found_is_404_with_bus_id() {
        let err = Error::NotFound("b-1".into());
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.status(), 404);
        assert_eq!(err.details(), Some(json!({ "bus_id": "b-1" })));
    }

    #[test]
    fn ignored_insert_is_not_a_validation_error() {
        let err = Error::EnqueueIgnored { bus_id: "b-1".into() };
        assert_eq!(err.code(), "enqueue_ignored");
        assert!(!err.is_validation());
    }
}
