//! The serialized envelope mirror: degraded copies, divergence, repair.
//!
//! Damage is injected through a second connection pool on the same
//! database file, the way an out-of-band writer would.

use std::sync::Arc;

use busq::db::Db;
use busq::debug::{MemorySink, StoreSink};
use busq::engine::Bus;
use busq::model::{Lifecycle, QState, SyncMethod};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use tempfile::TempDir;

struct Harness {
    bus: Bus,
    sink: Arc<MemorySink>,
    raw: SqlitePool,
    dir: TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("bus.db").display());
    let db = Db::connect(&url).await.expect("failed to open store");
    db.migrate().await.expect("failed to migrate");

    let sink = Arc::new(MemorySink::new());
    let bus = Bus::new(Arc::new(db)).with_debug_sink(sink.clone());
    let raw = SqlitePool::connect(&url)
        .await
        .expect("failed to open side pool");
    Harness {
        bus,
        sink,
        raw,
        dir,
    }
}

impl Harness {
    async fn set_bus_json(&self, bus_id: &str, bus_json: &str) {
        sqlx::query("UPDATE bus_messages SET bus_json = ?1 WHERE bus_id = ?2")
            .bind(bus_json)
            .bind(bus_id)
            .execute(&self.raw)
            .await
            .expect("failed to overwrite bus_json");
    }

    fn event_kinds(&self) -> Vec<String> {
        self.sink.events().into_iter().map(|e| e.kind).collect()
    }
}

fn request(bus_id: &str) -> Value {
    json!({
        "schema_id": "2PLT_BUS/v1",
        "bus_id": bus_id,
        "bus_ts": 100,
        "routing": { "from_owner_id": "planner", "to_owner_id": "worker" },
        "message": {
            "schema_id": "2PLT_MESSAGE/v1",
            "msg_type": "REQUEST",
            "op_id": "op-1",
            "flow": { "owner_id": "worker", "lane_id": "lane-a" },
            "request_id": "req-1",
            "in_state": "NEW"
        }
    })
}

// ---------------------------------------------------------------------------
// Degraded copies never fail the operation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_succeeds_when_copy_is_garbage() {
    let h = harness().await;
    h.bus.enqueue(&request("b-1")).await.unwrap();
    h.set_bus_json("b-1", "not json at all").await;

    let resp = h.bus.dequeue("worker", Some("w-1")).await.unwrap();
    assert!(resp.ok);
    assert!(resp.found);
    assert!(resp.envelope.is_none());

    let row = resp.row.unwrap();
    assert_eq!(row.claimed_by.as_deref(), Some("w-1"));
    assert_eq!(row.lifecycle(), Lifecycle::Claimed);

    let kinds = h.event_kinds();
    assert!(kinds.contains(&"claim_sync_failed".to_string()));
    assert!(kinds.contains(&"claim_envelope_unparsable".to_string()));
}

#[tokio::test]
async fn finalize_succeeds_when_copy_is_not_an_object() {
    let h = harness().await;
    h.bus.enqueue(&request("b-1")).await.unwrap();
    h.set_bus_json("b-1", "[1,2,3]").await;

    let resp = h
        .bus
        .finalize(&json!({ "bus_id": "b-1", "q_state": 1 }))
        .await
        .unwrap();
    assert!(resp.ok);
    assert!(!resp.sync.ok);
    assert_eq!(resp.sync.method, SyncMethod::ReadModifyWrite);
    assert!(resp.sync.error.is_some());

    let row = h.bus.db().get_row("b-1").await.unwrap().unwrap();
    assert_eq!(row.q_state, QState::Done);
    assert_eq!(row.bus_json, "[1,2,3]");
    assert_eq!(h.event_kinds(), vec!["finalize_sync_failed"]);
}

#[tokio::test]
async fn string_encoded_copy_is_patched_and_unwrapped() {
    let h = harness().await;
    h.bus.enqueue(&request("b-1")).await.unwrap();
    let stored = h.bus.db().get_row("b-1").await.unwrap().unwrap().bus_json;
    let double = serde_json::to_string(&stored).unwrap();
    h.set_bus_json("b-1", &double).await;

    let resp = h.bus.dequeue("worker", None).await.unwrap();
    let envelope = resp.envelope.unwrap();
    assert_eq!(envelope["claimed_by"], "worker");

    let row = h.bus.db().get_row("b-1").await.unwrap().unwrap();
    let doc: Value = serde_json::from_str(&row.bus_json).unwrap();
    assert!(doc.is_object());
    assert_eq!(doc["claimed_by"], "worker");
    assert!(h.sink.events().is_empty());
}

// ---------------------------------------------------------------------------
// Divergence and repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inspect_detects_and_repairs_divergence() {
    let h = harness().await;
    h.bus.enqueue(&request("b-1")).await.unwrap();
    h.bus.dequeue("worker", Some("w-1")).await.unwrap();

    sqlx::query(
        "UPDATE bus_messages
         SET bus_json = json_set(bus_json, '$.claimed_by', 'ghost', '$.q_state', 9)
         WHERE bus_id = 'b-1'",
    )
    .execute(&h.raw)
    .await
    .unwrap();

    let stale = h.bus.inspect("b-1", false).await.unwrap();
    assert!(!stale.in_sync);
    assert_eq!(stale.lifecycle, Lifecycle::Claimed);
    assert_eq!(stale.envelope.unwrap()["claimed_by"], "ghost");

    let repaired = h.bus.inspect("b-1", true).await.unwrap();
    assert!(repaired.in_sync);
    let report = repaired.repair.unwrap();
    assert!(report.ok);
    assert_eq!(report.method, SyncMethod::SqlJsonSet);

    let envelope = repaired.envelope.unwrap();
    assert_eq!(envelope["claimed_by"], "w-1");
    assert_eq!(envelope["q_state"], 0);
    assert_eq!(envelope["message"]["op_id"], "op-1");
}

#[tokio::test]
async fn late_sync_writes_current_columns() {
    let h = harness().await;
    h.bus.enqueue(&request("b-1")).await.unwrap();
    h.bus.dequeue("worker", Some("w-1")).await.unwrap();

    // A finalize lands on the columns before the claim's mirror runs.
    sqlx::query("UPDATE bus_messages SET q_state = 1, done_at = 1234 WHERE bus_id = 'b-1'")
        .execute(&h.raw)
        .await
        .unwrap();

    let report = h.bus.db().sync_envelope("b-1").await;
    assert!(report.ok);

    let row = h.bus.db().get_row("b-1").await.unwrap().unwrap();
    let doc = row.parse_envelope().unwrap();
    assert_eq!(doc["q_state"], 1);
    assert_eq!(doc["done_at"], 1234);
    assert_eq!(doc["claimed_by"], "w-1");
    assert!(h.bus.inspect("b-1", false).await.unwrap().in_sync);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_claims_and_finalizes_converge() {
    let h = harness().await;
    let ids: Vec<String> = (0..40).map(|i| format!("b-{i}")).collect();
    for id in &ids {
        h.bus.enqueue(&request(id)).await.unwrap();
    }

    let mut handles = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let bus = h.bus.clone();
        handles.push(tokio::spawn(async move {
            bus.dequeue("worker", Some(&format!("w-{i}"))).await.map(|_| ())
        }));
        let bus = h.bus.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            bus.finalize(&json!({ "bus_id": id, "q_state": 1 }))
                .await
                .map(|_| ())
        }));
    }
    for handle in handles {
        handle.await.expect("task panicked").unwrap();
    }

    for id in &ids {
        let resp = h.bus.inspect(id, false).await.unwrap();
        assert_eq!(resp.columns.q_state, QState::Done, "{id}");
        assert!(resp.in_sync, "{id} diverged: {:?}", resp.envelope);
    }
}

#[tokio::test]
async fn inspect_reports_unparsable_copy() {
    let h = harness().await;
    h.bus.enqueue(&request("b-1")).await.unwrap();
    h.set_bus_json("b-1", "{broken").await;

    let resp = h.bus.inspect("b-1", true).await.unwrap();
    assert!(resp.envelope.is_none());
    assert!(resp.parse_error.is_some());
    assert!(!resp.in_sync);
    assert!(!resp.repair.unwrap().ok);
}

#[tokio::test]
async fn repair_unknown_bus_id_is_not_found() {
    let h = harness().await;
    let err = h.bus.inspect("missing", true).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

// ---------------------------------------------------------------------------
// Persistent debug events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_sink_persists_sync_failures() {
    let h = harness().await;
    let db = Arc::new(
        Db::connect(&format!(
            "sqlite://{}",
            h.dir.path().join("bus.db").display()
        ))
        .await
        .unwrap(),
    );
    let bus = Bus::new(Arc::clone(&db)).with_debug_sink(Arc::new(StoreSink::new(Arc::clone(&db))));

    bus.enqueue(&request("b-1")).await.unwrap();
    h.set_bus_json("b-1", "nope").await;
    bus.finalize(&json!({ "bus_id": "b-1", "q_state": 9 }))
        .await
        .unwrap();

    let events = db.debug_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "finalize_sync_failed");
    assert_eq!(events[0].data["bus_id"], "b-1");
    assert_eq!(events[0].data["q_state"], 9);
}
