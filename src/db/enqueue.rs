//! Envelope insertion with duplicate detection.

use chrono::Utc;
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::model::{EnqueueOutcome, Envelope, QState};
use crate::telemetry::metrics;

impl super::Db {
    /// Insert a validated envelope, ignoring an existing `bus_id`.
    ///
    /// `INSERT OR IGNORE` also swallows CHECK violations, so a zero-row
    /// insert is re-checked: an existing row is a duplicate, a missing one
    /// means a constraint rejected the envelope (`enqueue_ignored`).
    pub async fn insert_envelope(&self, envelope: &Envelope) -> Result<EnqueueOutcome> {
        let r = &envelope.record;
        let bus_json = envelope.to_json()?;
        let inserted_at = Utc::now().timestamp_millis();

        let rows_affected = sqlx::query(
            "INSERT OR IGNORE INTO bus_messages (
                schema_id, bus_id, bus_ts, q_state,
                from_owner_id, to_owner_id,
                claimed_by, claimed_at, done_at,
                message_schema_id, msg_type, op_id,
                flow_owner_id, lane_id, request_id,
                in_state, state, out_state,
                bus_json, inserted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(&r.schema_id)
        .bind(&r.bus_id)
        .bind(r.bus_ts)
        .bind(QState::Pending.code())
        .bind(&r.from_owner_id)
        .bind(&r.to_owner_id)
        .bind(&r.message_schema_id)
        .bind(r.msg_type.as_str())
        .bind(&r.op_id)
        .bind(&r.flow_owner_id)
        .bind(&r.lane_id)
        .bind(&r.request_id)
        .bind(&r.in_state)
        .bind(&r.state)
        .bind(&r.out_state)
        .bind(&bus_json)
        .bind(inserted_at)
        .execute(self.pool())
        .await?
        .rows_affected();

        let duplicate = if rows_affected == 0 {
            if !self.exists(&r.bus_id).await? {
                metrics::enqueued().add(1, &[KeyValue::new("result", "ignored")]);
                tracing::warn!(bus_id = %r.bus_id, "insert ignored by a storage constraint");
                return Err(Error::EnqueueIgnored {
                    bus_id: r.bus_id.clone(),
                });
            }
            true
        } else {
            false
        };

        metrics::enqueued().add(
            1,
            &[KeyValue::new(
                "result",
                if duplicate { "duplicate" } else { "created" },
            )],
        );

        Ok(EnqueueOutcome {
            bus_id: r.bus_id.clone(),
            duplicate,
            bus_ts: r.bus_ts,
            q_state: QState::Pending,
        })
    }
}
