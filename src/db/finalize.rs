//! Terminal transitions.

use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::json;

use crate::error::{Error, Result};
use crate::model::{FinalizeOutcome, QState};
use crate::telemetry::metrics;

impl super::Db {
    /// Move an envelope to DONE or DEAD and stamp `done_at`.
    ///
    /// Unconditional on the current claim state. Finalizing twice simply
    /// overwrites the terminal state and `done_at`. Once the update has
    /// committed, nothing after it can fail the call.
    pub async fn finalize(&self, bus_id: &str, q_state: QState) -> Result<FinalizeOutcome> {
        if !q_state.is_terminal() {
            return Err(Error::InvalidQState {
                q_state: json!(q_state.code()),
            });
        }

        let done_at = Utc::now().timestamp();
        let rows_affected = sqlx::query(
            "UPDATE bus_messages SET q_state = ?1, done_at = ?2 WHERE bus_id = ?3",
        )
        .bind(q_state.code())
        .bind(done_at)
        .bind(bus_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(bus_id.to_string()));
        }

        metrics::finalized().add(1, &[KeyValue::new("q_state", q_state.to_string())]);

        let sync = self.sync_envelope(bus_id).await;

        Ok(FinalizeOutcome {
            bus_id: bus_id.to_string(),
            q_state,
            done_at,
            sync,
        })
    }
}
