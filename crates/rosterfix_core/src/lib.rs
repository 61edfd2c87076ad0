//! Relationship consistency engine for schemaless roster data.
//!
//! Relations are the source of truth for container/member association;
//! container member lists and fact references are caches and evidence that
//! this crate diagnoses, repairs, recovers and verifies against them.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{
    archive_collection, BatchLimits, CollectionNames, ConfigError, EngineConfig, OrphanFactPolicy,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::roster::{Container, Fact, Member, PairingKey, Relation, RECOVERED_SOURCE};
pub use repo::document_repo::{
    Document, DocumentRepository, RepoError, RepoResult, SqliteDocumentRepository, WriteOp,
    DEFAULT_MAX_BATCH_OPS,
};
pub use repo::memory_repo::InMemoryDocumentRepository;
pub use service::batch_writer::BoundedBatchWriter;
pub use service::diagnose_service::{
    DiagnoseError, Diagnoser, Diagnosis, DuplicateMemberAssignment, InconsistentProjection,
    OrphanedFactReference, OrphanedRelation,
};
pub use service::recovery_service::{Recoverer, RecoveryError, RecoveryResult};
pub use service::repair_service::{
    RepairCategory, RepairError, RepairOutcome, RepairResult, Repairer,
};
pub use service::snapshot::{FactCollection, ScopeSnapshot, SnapshotIndex};
pub use service::verify_service::{IntegrityReport, VerifyError, Verifier};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
