//! Reconstruction of lost relations from fact evidence.
//!
//! # Responsibility
//! - Recreate one relation per uncovered `(container, member)` pairing that
//!   facts still reference while both ends exist.
//! - Re-derive the projection of every container that gained a relation.
//!
//! # Invariants
//! - A snapshot load failure or a flush failure aborts the run.
//! - A failure to build one relation is recorded and the run continues.
//! - Recovered relations carry `source = "recovered"` and the recovery time.
//! - A second run over the same scope recovers nothing.

use crate::config::EngineConfig;
use crate::model::roster::{PairingKey, Relation, MEMBER_IDS_FIELD};
use crate::repo::document_repo::{DocumentRepository, RepoError, WriteOp};
use crate::service::batch_writer::BoundedBatchWriter;
use crate::service::now_epoch_ms;
use crate::service::snapshot::ScopeSnapshot;
use crate::service::verify_service::{IntegrityReport, Verifier, VerifyError};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

/// Counts and per-pairing failures of one recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub scope_id: String,
    pub relations_recovered: usize,
    pub containers_updated: usize,
    /// Human-readable message per pairing that could not be rebuilt.
    pub errors: Vec<String>,
}

/// Fatal errors from the recovery pass.
#[derive(Debug)]
pub enum RecoveryError {
    /// The initial snapshot could not be loaded.
    Load(RepoError),
    /// A batch flush failed; earlier batches stay committed.
    Flush(RepoError),
    /// The follow-up verification failed.
    Verify(VerifyError),
}

impl Display for RecoveryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "failed to load scope snapshot: {err}"),
            Self::Flush(err) => write!(f, "recovery flush failed: {err}"),
            Self::Verify(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RecoveryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) | Self::Flush(err) => Some(err),
            Self::Verify(err) => Some(err),
        }
    }
}

impl From<VerifyError> for RecoveryError {
    fn from(value: VerifyError) -> Self {
        Self::Verify(value)
    }
}

/// Recovery use-case service.
pub struct Recoverer<R: DocumentRepository> {
    repo: R,
    config: EngineConfig,
}

impl<R: DocumentRepository> Recoverer<R> {
    pub fn new(repo: R, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    /// Recovers missing relations of `scope_id`, stamped with the current time.
    pub fn recover(&self, scope_id: &str) -> Result<RecoveryResult, RecoveryError> {
        self.recover_at(scope_id, now_epoch_ms())
    }

    /// Recovers and then re-reads the scope to report coverage.
    pub fn recover_and_verify(
        &self,
        scope_id: &str,
    ) -> Result<(RecoveryResult, IntegrityReport), RecoveryError> {
        let result = self.recover(scope_id)?;
        let report = Verifier::new(&self.repo, self.config.clone()).verify(scope_id)?;
        Ok((result, report))
    }

    /// Recovers missing relations, stamping them with `now_ms`.
    pub fn recover_at(&self, scope_id: &str, now_ms: i64) -> Result<RecoveryResult, RecoveryError> {
        let started_at = Instant::now();
        info!("event=recover module=recoverer status=start scope={scope_id}");

        let snapshot = ScopeSnapshot::load(&self.repo, &self.config.collections, scope_id)
            .map_err(|err| {
                error!(
                    "event=recover module=recoverer status=error scope={scope_id} duration_ms={} error_code=load_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                RecoveryError::Load(err)
            })?;

        let result = self.rebuild(&snapshot, now_ms).map_err(|err| {
            error!(
                "event=recover module=recoverer status=error scope={scope_id} duration_ms={} error_code=flush_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            err
        })?;

        if !result.errors.is_empty() {
            warn!(
                "event=recover_pairing_errors module=recoverer status=warn scope={scope_id} errors={}",
                result.errors.len()
            );
        }
        info!(
            "event=recover module=recoverer status=ok scope={scope_id} relations_recovered={} containers_updated={} errors={} duration_ms={}",
            result.relations_recovered,
            result.containers_updated,
            result.errors.len(),
            started_at.elapsed().as_millis()
        );
        Ok(result)
    }

    fn rebuild(&self, snapshot: &ScopeSnapshot, now_ms: i64) -> Result<RecoveryResult, RecoveryError> {
        let index = snapshot.index();
        let names = &self.config.collections;

        let mut missing = BTreeSet::new();
        for fact_collection in &snapshot.fact_collections {
            for fact in &fact_collection.facts {
                if !index.has_container(&fact.container_id) || !index.has_member(&fact.member_id) {
                    continue;
                }
                let key = fact.key();
                if !index.covered.contains(&key) {
                    missing.insert(key);
                }
            }
        }

        let mut result = RecoveryResult {
            scope_id: snapshot.scope_id.clone(),
            ..RecoveryResult::default()
        };
        let mut writer = BoundedBatchWriter::new(&self.repo, self.config.batch);
        let mut gained: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for key in &missing {
            match recovered_relation_data(&snapshot.scope_id, key, now_ms) {
                Ok((relation_id, data)) => {
                    writer
                        .push(WriteOp::set(&names.relations, &relation_id, data))
                        .map_err(RecoveryError::Flush)?;
                    gained
                        .entry(key.container_id.as_str())
                        .or_default()
                        .insert(key.member_id.as_str());
                    result.relations_recovered += 1;
                }
                Err(reason) => result
                    .errors
                    .push(format!("failed to recover {key}: {reason}")),
            }
        }
        writer.flush().map_err(RecoveryError::Flush)?;

        let containers: BTreeMap<&str, &Vec<String>> = snapshot
            .containers
            .iter()
            .map(|container| (container.id.as_str(), &container.member_ids))
            .collect();
        for (container_id, recovered_members) in gained {
            let mut member_ids = index.members_of(container_id);
            member_ids.extend(recovered_members);
            let projection: Vec<String> = member_ids.into_iter().map(str::to_string).collect();
            if containers.get(container_id).copied() == Some(&projection) {
                continue;
            }

            let mut data = Map::new();
            data.insert(MEMBER_IDS_FIELD.to_string(), json!(projection));
            writer
                .push(WriteOp::update(&names.containers, container_id, data))
                .map_err(RecoveryError::Flush)?;
            result.containers_updated += 1;
        }
        writer.flush().map_err(RecoveryError::Flush)?;

        Ok(result)
    }
}

/// Builds the id and body of one recovered relation.
fn recovered_relation_data(
    scope_id: &str,
    key: &PairingKey,
    now_ms: i64,
) -> Result<(String, Map<String, Value>), String> {
    for (field, value) in [
        ("containerId", key.container_id.as_str()),
        ("memberId", key.member_id.as_str()),
    ] {
        if value.trim().is_empty() {
            return Err(format!("{field} is empty"));
        }
    }

    let relation = Relation::recovered(Uuid::new_v4().to_string(), scope_id, key, now_ms);
    let data = relation
        .to_data()
        .map_err(|err| format!("cannot encode relation: {err}"))?;
    Ok((relation.id, data))
}

#[cfg(test)]
mod tests {
    use super::recovered_relation_data;
    use crate::model::roster::PairingKey;
    use serde_json::json;

    #[test]
    fn builds_relation_body_with_provenance() {
        let (id, data) =
            recovered_relation_data("club", &PairingKey::new("T9", "M9"), 42).unwrap();
        assert!(!id.is_empty());
        assert_eq!(data["scopeId"], json!("club"));
        assert_eq!(data["source"], json!("recovered"));
        assert_eq!(data["recoveredAt"], json!(42));
    }

    #[test]
    fn identifiers_containing_separator_are_recovered() {
        let (_, data) =
            recovered_relation_data("club", &PairingKey::new("T|9", "M9"), 42).unwrap();
        assert_eq!(data["containerId"], json!("T|9"));
    }

    #[test]
    fn rejects_blank_identifiers() {
        let err = recovered_relation_data("club", &PairingKey::new("T9", " "), 42).unwrap_err();
        assert!(err.contains("memberId"));
    }
}
