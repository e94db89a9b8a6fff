//! Claiming: hand the oldest pending envelope for an owner to one claimant.
//!
//! Selection is `q_state = 0 AND to_owner_id = ? AND claimed_by IS NULL`,
//! ordered by `(bus_ts, insertion order)`. Exclusivity comes from the
//! `claimed_by IS NULL` guard on the update, never from a held lock.

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::{BusRowRecord, ROW_COLUMNS};
use crate::error::{Error, Result};
use crate::model::{BusRow, ClaimStrategy, ClaimedEnvelope};
use crate::telemetry::metrics;

/// Attempts the two-step protocol makes before reporting nothing found.
pub const MAX_CLAIM_ATTEMPTS: usize = 3;

impl super::Db {
    /// Claim the next pending envelope addressed to `owner`.
    ///
    /// Returns `None` when nothing is claimable (or, on the two-step path,
    /// when every attempt lost its race). Callers are expected to poll.
    pub async fn claim(&self, owner: &str, claimant: &str) -> Result<Option<ClaimedEnvelope>> {
        let now = Utc::now().timestamp();

        let (row, strategy) = match self.claim_strategy() {
            // Only a failed statement falls back. A returned row is already
            // claimed, so converting it must not trigger a second claim.
            ClaimStrategy::Returning => match self.claim_returning(owner, claimant, now).await {
                Ok(record) => (
                    record.map(BusRowRecord::try_into_bus_row).transpose()?,
                    ClaimStrategy::Returning,
                ),
                Err(e) => {
                    warn!(error = %e, owner, "single-statement claim failed, using two-step");
                    (
                        self.claim_two_step(owner, claimant, now).await?,
                        ClaimStrategy::TwoStep,
                    )
                }
            },
            ClaimStrategy::TwoStep => (
                self.claim_two_step(owner, claimant, now).await?,
                ClaimStrategy::TwoStep,
            ),
        };

        let Some(row) = row else {
            return Ok(None);
        };

        metrics::claims().add(
            1,
            &[
                KeyValue::new("result", "claimed"),
                KeyValue::new("strategy", strategy.as_str()),
            ],
        );

        let sync = self.sync_envelope(&row.bus_id).await;
        let envelope = row.parse_envelope().map(|mut doc| {
            row.control().apply_to(&mut doc);
            doc
        });

        Ok(Some(ClaimedEnvelope {
            row,
            envelope,
            sync,
        }))
    }

    /// Select, guard, and return the winning row in one statement.
    async fn claim_returning(
        &self,
        owner: &str,
        claimant: &str,
        now: i64,
    ) -> Result<Option<BusRowRecord>> {
        let row: Option<BusRowRecord> = sqlx::query_as(&format!(
            "UPDATE bus_messages
             SET claimed_by = ?1, claimed_at = ?2
             WHERE bus_id = (
                 SELECT bus_id FROM bus_messages
                 WHERE q_state = 0 AND to_owner_id = ?3 AND claimed_by IS NULL
                 ORDER BY bus_ts ASC, rowid ASC
                 LIMIT 1
             )
             AND claimed_by IS NULL
             RETURNING {ROW_COLUMNS}"
        ))
        .bind(claimant)
        .bind(now)
        .bind(owner)
        .fetch_optional(self.pool())
        .await?;

        if row.is_none() {
            metrics::claims().add(
                1,
                &[
                    KeyValue::new("result", "empty"),
                    KeyValue::new("strategy", ClaimStrategy::Returning.as_str()),
                ],
            );
        }

        Ok(row)
    }

    /// Read a candidate, conditionally update it, re-read on success.
    ///
    /// A zero-row update means another claimant won; retry against a fresh
    /// candidate up to [`MAX_CLAIM_ATTEMPTS`] times.
    async fn claim_two_step(
        &self,
        owner: &str,
        claimant: &str,
        now: i64,
    ) -> Result<Option<BusRow>> {
        let strategy = KeyValue::new("strategy", ClaimStrategy::TwoStep.as_str());

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let picked: Option<(String,)> = sqlx::query_as(
                "SELECT bus_id FROM bus_messages
                 WHERE q_state = 0 AND to_owner_id = ?1 AND claimed_by IS NULL
                 ORDER BY bus_ts ASC, rowid ASC
                 LIMIT 1",
            )
            .bind(owner)
            .fetch_optional(self.pool())
            .await?;

            let Some((bus_id,)) = picked else {
                metrics::claims().add(1, &[KeyValue::new("result", "empty"), strategy.clone()]);
                return Ok(None);
            };

            let rows_affected = sqlx::query(
                "UPDATE bus_messages
                 SET claimed_by = ?1, claimed_at = ?2
                 WHERE bus_id = ?3 AND claimed_by IS NULL",
            )
            .bind(claimant)
            .bind(now)
            .bind(&bus_id)
            .execute(self.pool())
            .await?
            .rows_affected();

            if rows_affected == 0 {
                debug!(%bus_id, attempt, "lost claim race");
                continue;
            }

            return match self.get_row(&bus_id).await? {
                Some(row) => Ok(Some(row)),
                None => Err(Error::InconsistentState(bus_id)),
            };
        }

        metrics::claims().add(1, &[KeyValue::new("result", "contended"), strategy]);
        Ok(None)
    }
}
