//! Mirror the queue-control columns into the serialized envelope.
//!
//! Relational columns are authoritative. After each mutation the four
//! engine-owned keys (`q_state`, `claimed_by`, `claimed_at`, `done_at`) of
//! `bus_json` are overwritten with the row's current column values; no
//! other key is touched. Failures are reported, never raised.
//!
//! Values are always read from the row at patch time, never from a
//! caller's snapshot, so whichever sync runs last writes the latest state.

use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{QState, QueueControl, SyncMethod, SyncReport, parse_stored_envelope};
use crate::telemetry::metrics;

/// Compare-and-swap rounds the read/patch/write path makes.
const MAX_PATCH_ATTEMPTS: usize = 3;

impl super::Db {
    /// Bring `bus_json` for `bus_id` in line with its columns.
    ///
    /// Tries an in-database `json_set` first, then a read/patch/write round
    /// trip. Always returns a report; never fails the calling operation.
    pub async fn sync_envelope(&self, bus_id: &str) -> SyncReport {
        match self.sync_json_set(bus_id).await {
            Ok(true) => {
                return record(SyncReport {
                    ok: true,
                    method: SyncMethod::SqlJsonSet,
                    error: None,
                });
            }
            Ok(false) => debug!(bus_id, "json_set matched no object row"),
            Err(e) => debug!(bus_id, error = %e, "json_set failed"),
        }

        let report = match self.sync_read_modify_write(bus_id).await {
            Ok(()) => SyncReport {
                ok: true,
                method: SyncMethod::ReadModifyWrite,
                error: None,
            },
            Err(e) => {
                warn!(bus_id, error = %e, "serialized envelope left out of sync");
                SyncReport {
                    ok: false,
                    method: SyncMethod::ReadModifyWrite,
                    error: Some(e.to_string()),
                }
            }
        };
        record(report)
    }

    /// Re-run the mirror for an existing row.
    pub async fn repair_envelope(&self, bus_id: &str) -> Result<SyncReport> {
        if !self.exists(bus_id).await? {
            return Err(Error::NotFound(bus_id.to_string()));
        }
        Ok(self.sync_envelope(bus_id).await)
    }

    /// Patch in place from the row's own columns. `Ok(false)` when the
    /// stored value is not an object.
    async fn sync_json_set(&self, bus_id: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE bus_messages
             SET bus_json = json_set(bus_json,
                 '$.q_state', q_state,
                 '$.claimed_by', claimed_by,
                 '$.claimed_at', claimed_at,
                 '$.done_at', done_at)
             WHERE bus_id = ?1 AND json_type(bus_json) = 'object'",
        )
        .bind(bus_id)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Parse, patch, and write back. The write is guarded on both the
    /// document and the columns it was patched from; a lost race re-reads.
    async fn sync_read_modify_write(&self, bus_id: &str) -> Result<()> {
        for attempt in 1..=MAX_PATCH_ATTEMPTS {
            let stored: Option<(String, i64, Option<String>, Option<i64>, Option<i64>)> =
                sqlx::query_as(
                    "SELECT bus_json, q_state, claimed_by, claimed_at, done_at
                     FROM bus_messages WHERE bus_id = ?1",
                )
                .bind(bus_id)
                .fetch_optional(self.pool())
                .await?;
            let (raw, q_state, claimed_by, claimed_at, done_at) =
                stored.ok_or_else(|| Error::Other("bus_json_missing".into()))?;

            let control = QueueControl {
                q_state: QState::from_code(q_state)
                    .ok_or_else(|| Error::Other(format!("unknown q_state code: {q_state}")))?,
                claimed_by,
                claimed_at,
                done_at,
            };

            let mut doc = parse_stored_envelope(&raw).map_err(Error::Other)?;
            control.apply_to(&mut doc);
            let patched = serde_json::to_string(&doc)
                .map_err(|e| Error::Other(format!("failed to serialize envelope: {e}")))?;

            let rows_affected = sqlx::query(
                "UPDATE bus_messages SET bus_json = ?1
                 WHERE bus_id = ?2 AND bus_json = ?3
                   AND q_state = ?4 AND claimed_by IS ?5
                   AND claimed_at IS ?6 AND done_at IS ?7",
            )
            .bind(&patched)
            .bind(bus_id)
            .bind(&raw)
            .bind(control.q_state.code())
            .bind(&control.claimed_by)
            .bind(control.claimed_at)
            .bind(control.done_at)
            .execute(self.pool())
            .await?
            .rows_affected();

            if rows_affected > 0 {
                return Ok(());
            }
            debug!(bus_id, attempt, "row changed during patch");
        }
        Err(Error::Other("bus_json changed during patch".into()))
    }
}

fn record(report: SyncReport) -> SyncReport {
    let method = match report.method {
        SyncMethod::SqlJsonSet => "sql_json_set",
        SyncMethod::ReadModifyWrite => "read_modify_write",
    };
    metrics::envelope_syncs().add(
        1,
        &[
            KeyValue::new("result", if report.ok { "ok" } else { "failed" }),
            KeyValue::new("method", method),
        ],
    );
    report
}
