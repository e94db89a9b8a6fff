//! Queue store: connection pool, migrations, and row access.
//!
//! One SQLite database holds the `bus_messages` table. All coordination
//! between concurrent producers and claimants goes through conditional
//! statements against it; there is no in-process locking.

pub mod claim;
pub mod enqueue;
pub mod finalize;
pub mod sync;

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::{Error, Result};
use crate::model::{BusRow, ClaimStrategy, QState};

/// Columns selected (or returned) for a full row, in `BusRowRecord` order.
pub(crate) const ROW_COLUMNS: &str = "schema_id, bus_id, bus_ts, q_state, from_owner_id, to_owner_id, \
     claimed_by, claimed_at, done_at, message_schema_id, msg_type, op_id, flow_owner_id, lane_id, \
     request_id, in_state, state, out_state, bus_json, inserted_at";

/// Database handle. Owns the connection pool shared by all operations.
pub struct Db {
    pool: SqlitePool,
    claim_strategy: ClaimStrategy,
}

impl Db {
    /// Open (creating if missing) a file-backed store.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            claim_strategy: ClaimStrategy::default(),
        })
    }

    /// Create an in-memory store (for testing). Migrated on return.
    ///
    /// Each SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            claim_strategy: ClaimStrategy::default(),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Select the claim protocol.
    pub fn with_claim_strategy(mut self, strategy: ClaimStrategy) -> Self {
        self.claim_strategy = strategy;
        self
    }

    pub fn claim_strategy(&self) -> ClaimStrategy {
        self.claim_strategy
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get a full row by `bus_id`.
    pub async fn get_row(&self, bus_id: &str) -> Result<Option<BusRow>> {
        let row: Option<BusRowRecord> = sqlx::query_as(&format!(
            "SELECT {ROW_COLUMNS} FROM bus_messages WHERE bus_id = ?1"
        ))
        .bind(bus_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BusRowRecord::try_into_bus_row).transpose()
    }

    /// Does a row with this `bus_id` exist?
    pub async fn exists(&self, bus_id: &str) -> Result<bool> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM bus_messages WHERE bus_id = ?1")
            .bind(bus_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Count rows that a claim for `owner` could still pick.
    pub async fn count_claimable(&self, owner: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bus_messages
             WHERE q_state = 0 AND to_owner_id = ?1 AND claimed_by IS NULL",
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct BusRowRecord {
    schema_id: String,
    bus_id: String,
    bus_ts: i64,
    q_state: i64,
    from_owner_id: String,
    to_owner_id: String,
    claimed_by: Option<String>,
    claimed_at: Option<i64>,
    done_at: Option<i64>,
    message_schema_id: String,
    msg_type: String,
    op_id: String,
    flow_owner_id: String,
    lane_id: String,
    request_id: String,
    in_state: String,
    state: Option<String>,
    out_state: Option<String>,
    bus_json: String,
    inserted_at: i64,
}

impl BusRowRecord {
    pub(crate) fn try_into_bus_row(self) -> Result<BusRow> {
        let q_state = QState::from_code(self.q_state)
            .ok_or_else(|| Error::Other(format!("unknown q_state code: {}", self.q_state)))?;

        Ok(BusRow {
            schema_id: self.schema_id,
            bus_id: self.bus_id,
            bus_ts: self.bus_ts,
            q_state,
            from_owner_id: self.from_owner_id,
            to_owner_id: self.to_owner_id,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            done_at: self.done_at,
            message_schema_id: self.message_schema_id,
            msg_type: self.msg_type.parse()?,
            op_id: self.op_id,
            flow_owner_id: self.flow_owner_id,
            lane_id: self.lane_id,
            request_id: self.request_id,
            in_state: self.in_state,
            state: self.state,
            out_state: self.out_state,
            bus_json: self.bus_json,
            inserted_at: self.inserted_at,
        })
    }
}
