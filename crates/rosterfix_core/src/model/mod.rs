//! Roster domain model shared by every consistency pass.
//!
//! # Responsibility
//! - Define the four entity shapes the engine reads and writes.
//! - Keep document field naming (`camelCase`) in one place.
//!
//! # Invariants
//! - Relations are the authoritative container/member association.
//! - `Container::member_ids` is a derived cache and may be rebuilt at will.

pub mod roster;
