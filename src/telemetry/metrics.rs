//! Metric instrument factories for busq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider these are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for busq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("busq")
}

/// Counter: enqueue attempts that reached the store.
/// Labels: `result` ("created" | "duplicate" | "ignored").
pub fn enqueued() -> Counter<u64> {
    meter()
        .u64_counter("busq.enqueue")
        .with_description("Number of envelopes offered to the store")
        .build()
}

/// Counter: claim outcomes.
/// Labels: `result` ("claimed" | "empty" | "contended"), `strategy`.
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("busq.claims")
        .with_description("Number of claim attempts by outcome")
        .build()
}

/// Counter: terminal transitions.
/// Labels: `q_state` ("DONE" | "DEAD").
pub fn finalized() -> Counter<u64> {
    meter()
        .u64_counter("busq.finalized")
        .with_description("Number of envelopes finalized")
        .build()
}

/// Counter: serialized-envelope mirror patches.
/// Labels: `result` ("ok" | "failed"), `method`.
pub fn envelope_syncs() -> Counter<u64> {
    meter()
        .u64_counter("busq.sync")
        .with_description("Number of serialized envelope sync attempts")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("busq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
