//! Span helpers for bus operations.

use tracing::Span;

/// Start a span for one bus operation (`enqueue`, `claim`, `finalize`, ...).
///
/// `bus.id` is declared empty when not yet known (a claim learns it only
/// once a row is won) and can be filled via [`record_bus_id`].
pub fn start_op_span(operation: &'static str, owner: Option<&str>, bus_id: Option<&str>) -> Span {
    let span = tracing::info_span!(
        "bus.op",
        "bus.operation" = operation,
        "bus.owner" = tracing::field::Empty,
        "bus.id" = tracing::field::Empty,
    );
    if let Some(owner) = owner {
        span.record("bus.owner", owner);
    }
    if let Some(bus_id) = bus_id {
        span.record("bus.id", bus_id);
    }
    span
}

/// Record the envelope an operation ended up touching.
pub fn record_bus_id(span: &Span, bus_id: &str) {
    span.record("bus.id", bus_id);
}

/// Record the lifecycle state an envelope moved into.
pub fn record_transition(span: &Span, bus_id: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(bus_id, to, "lifecycle_transition");
    });
}
