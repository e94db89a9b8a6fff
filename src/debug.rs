//! Best-effort debug events.
//!
//! The engine reports noteworthy-but-harmless conditions (a serialized
//! envelope that could not be patched, a claimed copy that no longer
//! parses) to an injected [`DebugSink`]. The default sink drops
//! everything. Recording must never fail the operation that triggered it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Db;
use crate::error::Result;

/// A recorded debug event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    pub id: String,
    /// Epoch seconds.
    pub ts: i64,
    pub kind: String,
    pub data: Value,
}

impl DebugEvent {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts: Utc::now().timestamp(),
            kind: kind.to_string(),
            data,
        }
    }
}

/// Destination for debug events.
#[async_trait]
pub trait DebugSink: Send + Sync {
    async fn record(&self, kind: &str, data: Value);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl DebugSink for NoopSink {
    async fn record(&self, _kind: &str, _data: Value) {}
}

/// Emits events as `tracing` debug records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl DebugSink for TracingSink {
    async fn record(&self, kind: &str, data: Value) {
        tracing::debug!(kind, data = %data, "debug_event");
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<DebugEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DebugEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DebugSink for MemorySink {
    async fn record(&self, kind: &str, data: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(DebugEvent::new(kind, data));
        }
    }
}

/// Persists events to the `debug_events` table.
pub struct StoreSink {
    db: Arc<Db>,
}

impl StoreSink {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DebugSink for StoreSink {
    async fn record(&self, kind: &str, data: Value) {
        if let Err(e) = self.db.record_debug_event(&DebugEvent::new(kind, data)).await {
            tracing::debug!(kind, error = %e, "debug event dropped");
        }
    }
}

impl Db {
    /// Insert a debug event.
    pub async fn record_debug_event(&self, event: &DebugEvent) -> Result<()> {
        sqlx::query("INSERT INTO debug_events (id, ts, kind, data) VALUES (?1, ?2, ?3, ?4)")
            .bind(&event.id)
            .bind(event.ts)
            .bind(&event.kind)
            .bind(event.data.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Most recent debug events, newest first.
    pub async fn debug_events(&self, limit: i64) -> Result<Vec<DebugEvent>> {
        let rows: Vec<(String, i64, String, Option<String>)> = sqlx::query_as(
            "SELECT id, ts, kind, data FROM debug_events ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, ts, kind, data)| DebugEvent {
                id,
                ts,
                kind,
                data: data
                    .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
                    .unwrap_or(Value::Null),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_sink_keeps_events_in_order() {
        let sink = MemorySink::new();
        sink.record("first", json!({"n": 1})).await;
        sink.record("second", json!({"n": 2})).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "first");
        assert_eq!(events[1].data, json!({"n": 2}));
    }

    #[tokio::test]
    async fn store_sink_round_trips_through_table() {
        let db = Arc::new(Db::in_memory().await.unwrap());
        let sink = StoreSink::new(Arc::clone(&db));
        sink.record("sync_failed", json!({"bus_id": "b-1"})).await;

        let events = db.debug_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "sync_failed");
        assert_eq!(events[0].data["bus_id"], "b-1");
    }
}
