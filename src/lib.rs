//! # busq
//!
//! Durable point-to-point message bus backed by a single SQLite store.
//!
//! Producers enqueue `2PLT_BUS/v1` envelopes, exactly one consumer claims
//! each pending envelope for its destination owner, and the claimant
//! finalizes it as DONE or DEAD. Each envelope is stored twice: as
//! relational columns (authoritative for queue control) and as the full
//! serialized document (for round-trip fidelity of caller fields).

pub mod config;
pub mod db;
pub mod debug;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;
pub mod validate;
