//! Read-only coverage audit of one scope.

use crate::config::EngineConfig;
use crate::repo::document_repo::{DocumentRepository, RepoError};
use crate::service::snapshot::ScopeSnapshot;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Coverage statistics recomputed from a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub scope_id: String,
    pub total_facts: usize,
    /// Facts whose `(container, member)` pairing has a valid relation.
    pub facts_with_relation: usize,
    pub facts_without_relation: usize,
    /// Subset of `facts_without_relation` whose container is gone.
    pub facts_with_missing_container: usize,
    pub containers_with_members: usize,
    pub containers_without_members: usize,
    pub total_relations: usize,
    pub valid_relations: usize,
}

impl IntegrityReport {
    pub fn is_fully_covered(&self) -> bool {
        self.facts_without_relation == 0
    }

    pub fn from_snapshot(snapshot: &ScopeSnapshot) -> Self {
        let index = snapshot.index();
        let mut report = Self {
            scope_id: snapshot.scope_id.clone(),
            total_facts: snapshot.fact_count(),
            total_relations: snapshot.relations.len(),
            valid_relations: index.valid_relations.len(),
            ..Self::default()
        };

        for fact in snapshot
            .fact_collections
            .iter()
            .flat_map(|collection| collection.facts.iter())
        {
            if index.covered.contains(&fact.key()) {
                report.facts_with_relation += 1;
                continue;
            }
            report.facts_without_relation += 1;
            if !index.has_container(&fact.container_id) {
                report.facts_with_missing_container += 1;
            }
        }

        for container in &snapshot.containers {
            if container.member_ids.is_empty() {
                report.containers_without_members += 1;
            } else {
                report.containers_with_members += 1;
            }
        }
        report
    }
}

#[derive(Debug)]
pub enum VerifyError {
    Load(RepoError),
}

impl Display for VerifyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "failed to load scope snapshot: {err}"),
        }
    }
}

impl Error for VerifyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
        }
    }
}

/// Verification use-case service.
pub struct Verifier<R: DocumentRepository> {
    repo: R,
    config: EngineConfig,
}

impl<R: DocumentRepository> Verifier<R> {
    pub fn new(repo: R, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    pub fn verify(&self, scope_id: &str) -> Result<IntegrityReport, VerifyError> {
        let started_at = Instant::now();
        let snapshot = ScopeSnapshot::load(&self.repo, &self.config.collections, scope_id)
            .map_err(|err| {
                error!(
                    "event=verify module=verifier status=error scope={scope_id} duration_ms={} error_code=load_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                VerifyError::Load(err)
            })?;

        let report = IntegrityReport::from_snapshot(&snapshot);
        info!(
            "event=verify module=verifier status=ok scope={scope_id} total_facts={} covered={} uncovered={} containers_with_members={} containers_without_members={} duration_ms={}",
            report.total_facts,
            report.facts_with_relation,
            report.facts_without_relation,
            report.containers_with_members,
            report.containers_without_members,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }
}
