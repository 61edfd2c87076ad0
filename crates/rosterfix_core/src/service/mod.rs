//! Consistency use-case services.
//!
//! # Responsibility
//! - Orchestrate snapshot loads and batched writes into the four passes:
//!   diagnose, repair, recover and verify.
//! - Keep every pass storage-agnostic behind `DocumentRepository`.
//!
//! # Invariants
//! - Services never hold state between invocations; each call loads a
//!   fresh snapshot.
//! - Correctness under concurrent external writers is best-effort: no locks
//!   are taken and atomicity holds per flushed batch only.

pub mod batch_writer;
pub mod diagnose_service;
pub mod recovery_service;
pub mod repair_service;
pub mod snapshot;
pub mod verify_service;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix epoch milliseconds.
pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}
