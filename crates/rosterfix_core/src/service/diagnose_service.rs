//! Read-only diagnosis of relationship drift within one scope.
//!
//! # Responsibility
//! - Detect orphaned relations, duplicate member assignments, orphaned fact
//!   references and stale container projections.
//!
//! # Invariants
//! - Never writes to the store.
//! - A load failure aborts the diagnosis; no partial findings are returned.
//! - Every findings list is sorted so repeated runs produce equal reports.

use crate::config::EngineConfig;
use crate::repo::document_repo::{DocumentRepository, RepoError};
use crate::service::snapshot::ScopeSnapshot;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Relation whose container or member no longer exists in scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedRelation {
    pub relation_id: String,
    pub container_id: String,
    pub member_id: String,
    pub missing_container: bool,
    pub missing_member: bool,
}

/// Member attached to more than one container through valid relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateMemberAssignment {
    pub member_id: String,
    /// One entry per valid relation, so a repeated pair appears twice.
    pub container_ids: Vec<String>,
}

/// Fact whose container no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedFactReference {
    pub collection: String,
    pub fact_id: String,
    pub container_id: String,
    pub member_id: String,
}

/// Container whose cached member list disagrees with its relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InconsistentProjection {
    pub container_id: String,
    /// Cached `memberIds` exactly as stored.
    pub array_ids: Vec<String>,
    /// Members with a valid relation to the container, sorted.
    pub relation_ids: Vec<String>,
}

/// Structured drift report for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub scope_id: String,
    pub orphaned_relations: Vec<OrphanedRelation>,
    pub duplicate_member_assignments: Vec<DuplicateMemberAssignment>,
    pub orphaned_fact_references: Vec<OrphanedFactReference>,
    pub inconsistent_projections: Vec<InconsistentProjection>,
}

impl Diagnosis {
    /// Returns whether the scope is at the fixed point.
    pub fn is_clean(&self) -> bool {
        self.total_findings() == 0
    }

    pub fn total_findings(&self) -> usize {
        self.orphaned_relations.len()
            + self.duplicate_member_assignments.len()
            + self.orphaned_fact_references.len()
            + self.inconsistent_projections.len()
    }

    /// Computes the diagnosis of an already loaded snapshot.
    pub fn from_snapshot(snapshot: &ScopeSnapshot) -> Self {
        let index = snapshot.index();

        let mut orphaned_relations: Vec<OrphanedRelation> = snapshot
            .relations
            .iter()
            .filter(|relation| !index.is_valid(relation))
            .map(|relation| OrphanedRelation {
                relation_id: relation.id.clone(),
                container_id: relation.container_id.clone(),
                member_id: relation.member_id.clone(),
                missing_container: !index.has_container(&relation.container_id),
                missing_member: !index.has_member(&relation.member_id),
            })
            .collect();
        orphaned_relations.sort_by(|a, b| a.relation_id.cmp(&b.relation_id));

        // BTreeMap iteration already yields member ids in order.
        let duplicate_member_assignments = index
            .containers_by_member
            .iter()
            .filter(|(_, containers)| containers.len() > 1)
            .map(|(member_id, containers)| DuplicateMemberAssignment {
                member_id: (*member_id).to_string(),
                container_ids: containers.iter().map(|id| (*id).to_string()).collect(),
            })
            .collect();

        let mut orphaned_fact_references = Vec::new();
        for fact_collection in &snapshot.fact_collections {
            for fact in &fact_collection.facts {
                if index.has_container(&fact.container_id) {
                    continue;
                }
                orphaned_fact_references.push(OrphanedFactReference {
                    collection: fact_collection.collection.clone(),
                    fact_id: fact.id.clone(),
                    container_id: fact.container_id.clone(),
                    member_id: fact.member_id.clone(),
                });
            }
        }
        orphaned_fact_references.sort_by(|a, b| {
            (a.collection.as_str(), a.fact_id.as_str()).cmp(&(b.collection.as_str(), b.fact_id.as_str()))
        });

        let mut inconsistent_projections = Vec::new();
        for container in &snapshot.containers {
            let relation_ids = index.members_of(&container.id);
            let array_set: BTreeSet<&str> =
                container.member_ids.iter().map(String::as_str).collect();
            if container.member_ids.len() == relation_ids.len() && array_set == relation_ids {
                continue;
            }
            inconsistent_projections.push(InconsistentProjection {
                container_id: container.id.clone(),
                array_ids: container.member_ids.clone(),
                relation_ids: relation_ids.iter().map(|id| (*id).to_string()).collect(),
            });
        }
        inconsistent_projections.sort_by(|a, b| a.container_id.cmp(&b.container_id));

        Self {
            scope_id: snapshot.scope_id.clone(),
            orphaned_relations,
            duplicate_member_assignments,
            orphaned_fact_references,
            inconsistent_projections,
        }
    }
}

/// Errors from the diagnosis pass.
#[derive(Debug)]
pub enum DiagnoseError {
    /// A source collection could not be read or decoded.
    Load(RepoError),
}

impl Display for DiagnoseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "failed to load scope snapshot: {err}"),
        }
    }
}

impl Error for DiagnoseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
        }
    }
}

impl From<RepoError> for DiagnoseError {
    fn from(value: RepoError) -> Self {
        Self::Load(value)
    }
}

/// Diagnosis use-case service.
pub struct Diagnoser<R: DocumentRepository> {
    repo: R,
    config: EngineConfig,
}

impl<R: DocumentRepository> Diagnoser<R> {
    pub fn new(repo: R, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    /// Loads a fresh snapshot of `scope_id` and diagnoses it.
    pub fn diagnose(&self, scope_id: &str) -> Result<Diagnosis, DiagnoseError> {
        let started_at = Instant::now();
        info!("event=diagnose module=diagnoser status=start scope={scope_id}");

        let snapshot = match ScopeSnapshot::load(&self.repo, &self.config.collections, scope_id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(
                    "event=diagnose module=diagnoser status=error scope={scope_id} duration_ms={} error_code=load_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err.into());
            }
        };

        let diagnosis = Diagnosis::from_snapshot(&snapshot);
        info!(
            "event=diagnose module=diagnoser status=ok scope={scope_id} orphaned_relations={} duplicate_members={} orphaned_facts={} inconsistent_projections={} duration_ms={}",
            diagnosis.orphaned_relations.len(),
            diagnosis.duplicate_member_assignments.len(),
            diagnosis.orphaned_fact_references.len(),
            diagnosis.inconsistent_projections.len(),
            started_at.elapsed().as_millis()
        );
        Ok(diagnosis)
    }
}
