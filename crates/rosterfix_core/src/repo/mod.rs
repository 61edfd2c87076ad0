//! Document store boundary.
//!
//! # Responsibility
//! - Define the only external collaborator the engine consumes: per-collection
//!   scoped listing, point reads and a bounded atomic multi-write.
//! - Provide the SQLite adapter used in production and an in-memory fake.
//!
//! # Invariants
//! - `commit_batch` is all-or-nothing and rejects batches larger than
//!   `max_batch_ops()`.
//! - Repository APIs return semantic errors (`NotFound`, `BatchTooLarge`) in
//!   addition to transport errors.

pub mod document_repo;
pub mod memory_repo;
