//! The bus facade. The public API a transport talks to.
//!
//! Takes raw caller JSON, runs it through validation and the store, and
//! returns the logical response shapes. Owns the debug sink.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::Instrument;

use crate::db::Db;
use crate::debug::{DebugSink, NoopSink};
use crate::error::{Error, Result};
use crate::model::{BusRow, Lifecycle, QState, QueueControl, SyncReport, parse_stored_envelope};
use crate::telemetry::bus::{record_bus_id, record_transition, start_op_span};
use crate::telemetry::metrics;
use crate::validate;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub ok: bool,
    pub bus_id: String,
    pub duplicate: bool,
    pub bus_ts: i64,
    pub q_state: QState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DequeueResponse {
    pub ok: bool,
    pub found: bool,
    pub row: Option<BusRow>,
    /// The claimed envelope; `null` if the stored copy does not parse.
    pub envelope: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub ok: bool,
    pub bus_id: String,
    pub q_state: QState,
    pub done_at: i64,
    pub sync: SyncReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectResponse {
    pub ok: bool,
    pub bus_id: String,
    pub lifecycle: Lifecycle,
    /// Authoritative queue-control columns.
    pub columns: QueueControl,
    pub envelope: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    /// Whether the stored envelope mirrors `columns`.
    pub in_sync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<SyncReport>,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// The message bus. Cheap to clone; clones share the store and sink.
#[derive(Clone)]
pub struct Bus {
    db: Arc<Db>,
    debug: Arc<dyn DebugSink>,
}

impl Bus {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            debug: Arc::new(NoopSink),
        }
    }

    /// Create a bus over a fresh in-memory store (for testing).
    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Db::in_memory().await?)))
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = sink;
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Validate and store an envelope. Re-sending a known `bus_id` is a
    /// no-op reported as `duplicate: true`.
    pub async fn enqueue(&self, body: &Value) -> Result<EnqueueResponse> {
        let started = Instant::now();
        let envelope = validate::validate_envelope(body)?;
        let span = start_op_span("enqueue", None, Some(&envelope.record.bus_id));

        let outcome = async {
            let outcome = self.db.insert_envelope(&envelope).await?;
            if outcome.duplicate {
                tracing::info!(bus_id = %outcome.bus_id, "duplicate enqueue ignored");
            } else {
                tracing::info!(
                    bus_id = %outcome.bus_id,
                    to_owner_id = %envelope.record.to_owner_id,
                    msg_type = %envelope.record.msg_type,
                    "enqueued"
                );
            }
            Ok::<_, Error>(outcome)
        }
        .instrument(span)
        .await?;

        record_duration("enqueue", started);
        Ok(EnqueueResponse {
            ok: true,
            bus_id: outcome.bus_id,
            duplicate: outcome.duplicate,
            bus_ts: outcome.bus_ts,
            q_state: outcome.q_state,
        })
    }

    /// Parse a raw request body, then [`Bus::enqueue`] it.
    pub async fn enqueue_raw(&self, raw: &str) -> Result<EnqueueResponse> {
        let body = validate::parse_body(raw)?;
        self.enqueue(&body).await
    }

    /// Claim the oldest pending envelope addressed to `owner`.
    ///
    /// The claimant defaults to the owner itself.
    pub async fn dequeue(&self, owner: &str, claimant: Option<&str>) -> Result<DequeueResponse> {
        let started = Instant::now();
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(Error::MissingOwnerId);
        }
        let claimant = claimant
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(owner);

        let span = start_op_span("claim", Some(owner), None);
        let claimed = self
            .db
            .claim(owner, claimant)
            .instrument(span.clone())
            .await?;

        let response = match claimed {
            None => DequeueResponse {
                ok: true,
                found: false,
                row: None,
                envelope: None,
            },
            Some(claimed) => {
                let bus_id = claimed.row.bus_id.clone();
                record_bus_id(&span, &bus_id);
                record_transition(&span, &bus_id, "claimed");

                if !claimed.sync.ok {
                    self.debug
                        .record(
                            "claim_sync_failed",
                            json!({ "bus_id": bus_id, "claimed_by": claimant, "sync": claimed.sync }),
                        )
                        .await;
                }
                if claimed.envelope.is_none() {
                    self.debug
                        .record("claim_envelope_unparsable", json!({ "bus_id": bus_id }))
                        .await;
                }

                DequeueResponse {
                    ok: true,
                    found: true,
                    row: Some(claimed.row),
                    envelope: claimed.envelope,
                }
            }
        };

        record_duration("claim", started);
        Ok(response)
    }

    /// Finalize an envelope as DONE (1) or DEAD (9).
    ///
    /// Accepts `{bus_id, q_state}` or a dequeue response's `{row: {...}}`.
    pub async fn finalize(&self, body: &Value) -> Result<FinalizeResponse> {
        let started = Instant::now();
        let input = validate::finalize_input(body)?;
        let span = start_op_span("finalize", None, Some(&input.bus_id));

        let outcome = self
            .db
            .finalize(&input.bus_id, input.q_state)
            .instrument(span.clone())
            .await?;

        let to = outcome.q_state.to_string().to_lowercase();
        record_transition(&span, &outcome.bus_id, &to);

        if !outcome.sync.ok {
            self.debug
                .record(
                    "finalize_sync_failed",
                    json!({ "bus_id": outcome.bus_id, "q_state": outcome.q_state, "sync": outcome.sync }),
                )
                .await;
        }

        record_duration("finalize", started);
        Ok(FinalizeResponse {
            ok: true,
            bus_id: outcome.bus_id,
            q_state: outcome.q_state,
            done_at: outcome.done_at,
            sync: outcome.sync,
        })
    }

    /// Compare a row's columns with its stored envelope, optionally
    /// re-running the mirror first.
    pub async fn inspect(&self, bus_id: &str, repair: bool) -> Result<InspectResponse> {
        let bus_id = bus_id.trim();
        if bus_id.is_empty() {
            return Err(Error::MissingBusId);
        }

        let repair = if repair {
            Some(self.db.repair_envelope(bus_id).await?)
        } else {
            None
        };

        let row = self
            .db
            .get_row(bus_id)
            .await?
            .ok_or_else(|| Error::NotFound(bus_id.to_string()))?;

        let columns = row.control();
        let (envelope, parse_error) = match parse_stored_envelope(&row.bus_json) {
            Ok(doc) => (Some(doc), None),
            Err(e) => (None, Some(e)),
        };
        let in_sync = envelope.as_ref().is_some_and(|doc| columns.matches(doc));

        Ok(InspectResponse {
            ok: true,
            bus_id: row.bus_id.clone(),
            lifecycle: columns.lifecycle(),
            columns,
            envelope,
            parse_error,
            in_sync,
            repair,
        })
    }
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}
