//! Corrective writes driven by a diagnosis.
//!
//! # Responsibility
//! - Delete orphaned relations and orphaned facts (or archive the facts).
//! - Resolve duplicate member assignments to the most recent relation.
//! - Rewrite container projections from the surviving relations.
//!
//! # Invariants
//! - Categories run in a fixed order and each ends with a flush; a category
//!   is counted only once its last flush succeeded.
//! - Duplicate survivors are chosen by `createdAt` descending, then absent
//!   timestamps last, then ascending relation id.
//! - Re-running on the same diagnosis converges to the same end state.

use crate::config::{archive_collection, EngineConfig, OrphanFactPolicy};
use crate::model::roster::{Container, Relation, MEMBER_IDS_FIELD};
use crate::repo::document_repo::{DocumentRepository, RepoError, RepoResult, WriteOp};
use crate::service::batch_writer::BoundedBatchWriter;
use crate::service::diagnose_service::{
    DiagnoseError, Diagnoser, Diagnosis, DuplicateMemberAssignment,
};
use crate::service::now_epoch_ms;
use crate::service::snapshot::decode_document;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Per-category repair counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub orphaned_relations_deleted: usize,
    pub duplicate_relations_deleted: usize,
    pub orphaned_facts_deleted: usize,
    pub orphaned_facts_archived: usize,
    pub projections_rewritten: usize,
    /// Sum of every category count above.
    pub total: usize,
}

impl RepairResult {
    fn record(&mut self, category: RepairCategory, count: usize) {
        match category {
            RepairCategory::OrphanedRelations => self.orphaned_relations_deleted += count,
            RepairCategory::DuplicateAssignments => self.duplicate_relations_deleted += count,
            RepairCategory::OrphanedFacts => {}
            RepairCategory::Projections => self.projections_rewritten += count,
        }
        self.total += count;
    }

    fn record_facts(&mut self, deleted: usize, archived: usize) {
        self.orphaned_facts_deleted += deleted;
        self.orphaned_facts_archived += archived;
        self.total += deleted + archived;
    }
}

/// Repair category, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairCategory {
    OrphanedRelations,
    DuplicateAssignments,
    OrphanedFacts,
    Projections,
}

impl RepairCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrphanedRelations => "orphaned_relations",
            Self::DuplicateAssignments => "duplicate_assignments",
            Self::OrphanedFacts => "orphaned_facts",
            Self::Projections => "projections",
        }
    }
}

/// Errors from the repair pass.
///
/// Store failures carry the counts of categories completed before them.
#[derive(Debug)]
pub enum RepairError {
    /// A re-read needed by `category` failed.
    Load {
        category: RepairCategory,
        source: RepoError,
        completed: RepairResult,
    },
    /// A batch flush of `category` failed; later categories were skipped.
    Flush {
        category: RepairCategory,
        source: RepoError,
        completed: RepairResult,
    },
    /// Diagnosis before or after repair failed.
    Diagnose(DiagnoseError),
}

impl RepairError {
    /// Counts of categories fully flushed before the failure.
    pub fn completed(&self) -> Option<&RepairResult> {
        match self {
            Self::Load { completed, .. } | Self::Flush { completed, .. } => Some(completed),
            Self::Diagnose(_) => None,
        }
    }
}

impl Display for RepairError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load {
                category, source, ..
            } => write!(f, "repair read failed during {}: {source}", category.as_str()),
            Self::Flush {
                category, source, ..
            } => write!(f, "repair flush failed during {}: {source}", category.as_str()),
            Self::Diagnose(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepairError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load { source, .. } | Self::Flush { source, .. } => Some(source),
            Self::Diagnose(err) => Some(err),
        }
    }
}

impl From<DiagnoseError> for RepairError {
    fn from(value: DiagnoseError) -> Self {
        Self::Diagnose(value)
    }
}

/// Outcome of a diagnose, repair, re-diagnose cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub diagnosis: Diagnosis,
    pub result: RepairResult,
    /// Findings left after repair; empty at the fixed point.
    pub residual: Diagnosis,
}

/// Survivor chosen for each conflicted member.
type Survivors = BTreeMap<String, Option<String>>;

/// Repair use-case service.
pub struct Repairer<R: DocumentRepository> {
    repo: R,
    config: EngineConfig,
}

impl<R: DocumentRepository> Repairer<R> {
    pub fn new(repo: R, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    /// Applies every corrective write implied by `diagnosis`.
    pub fn repair(&self, diagnosis: &Diagnosis) -> Result<RepairResult, RepairError> {
        let started_at = Instant::now();
        let scope_id = diagnosis.scope_id.as_str();
        info!(
            "event=repair module=repairer status=start scope={scope_id} findings={}",
            diagnosis.total_findings()
        );

        match self.apply(diagnosis) {
            Ok(result) => {
                info!(
                    "event=repair module=repairer status=ok scope={scope_id} orphaned_relations={} duplicate_relations={} facts_deleted={} facts_archived={} projections={} total={} duration_ms={}",
                    result.orphaned_relations_deleted,
                    result.duplicate_relations_deleted,
                    result.orphaned_facts_deleted,
                    result.orphaned_facts_archived,
                    result.projections_rewritten,
                    result.total,
                    started_at.elapsed().as_millis()
                );
                Ok(result)
            }
            Err(err) => {
                error!(
                    "event=repair module=repairer status=error scope={scope_id} completed_total={} duration_ms={} error={}",
                    err.completed().map_or(0, |completed| completed.total),
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Diagnoses `scope_id`, repairs it, and diagnoses again.
    pub fn run_to_fixed_point(&self, scope_id: &str) -> Result<RepairOutcome, RepairError> {
        let diagnoser = Diagnoser::new(&self.repo, self.config.clone());
        let diagnosis = diagnoser.diagnose(scope_id)?;
        let result = self.repair(&diagnosis)?;
        let residual = diagnoser.diagnose(scope_id)?;
        if !residual.is_clean() {
            warn!(
                "event=repair_residual module=repairer status=warn scope={scope_id} findings={}",
                residual.total_findings()
            );
        }
        Ok(RepairOutcome {
            diagnosis,
            result,
            residual,
        })
    }

    fn apply(&self, diagnosis: &Diagnosis) -> Result<RepairResult, RepairError> {
        let names = &self.config.collections;
        let mut writer = BoundedBatchWriter::new(&self.repo, self.config.batch);
        let mut result = RepairResult::default();

        // 1. Orphaned relations.
        let category = RepairCategory::OrphanedRelations;
        let mut deleted_relations = HashSet::new();
        for orphan in &diagnosis.orphaned_relations {
            writer
                .push(WriteOp::delete(&names.relations, &orphan.relation_id))
                .map_err(|source| flush_error(category, source, result))?;
            deleted_relations.insert(orphan.relation_id.as_str());
        }
        writer
            .flush()
            .map_err(|source| flush_error(category, source, result))?;
        result.record(category, diagnosis.orphaned_relations.len());

        // 2. Duplicate member assignments.
        let category = RepairCategory::DuplicateAssignments;
        let mut survivors = Survivors::new();
        if !diagnosis.duplicate_member_assignments.is_empty() {
            let relations = self
                .load_relations(&diagnosis.scope_id)
                .map_err(|source| load_error(category, source, result))?;
            let mut deleted = 0;
            for assignment in &diagnosis.duplicate_member_assignments {
                let (survivor, losers) =
                    resolve_duplicate(assignment, &relations, &deleted_relations);
                for loser in losers {
                    writer
                        .push(WriteOp::delete(&names.relations, &loser.id))
                        .map_err(|source| flush_error(category, source, result))?;
                    deleted += 1;
                }
                survivors.insert(
                    assignment.member_id.clone(),
                    survivor.map(|relation| relation.container_id.clone()),
                );
            }
            writer
                .flush()
                .map_err(|source| flush_error(category, source, result))?;
            result.record(category, deleted);
        }

        // 3. Orphaned fact references.
        let category = RepairCategory::OrphanedFacts;
        let (mut facts_deleted, mut facts_archived) = (0, 0);
        let archived_at = now_epoch_ms();
        for orphan in &diagnosis.orphaned_fact_references {
            match self.config.orphan_fact_policy {
                OrphanFactPolicy::Delete => {
                    writer
                        .push(WriteOp::delete(&orphan.collection, &orphan.fact_id))
                        .map_err(|source| flush_error(category, source, result))?;
                    facts_deleted += 1;
                }
                OrphanFactPolicy::Archive => {
                    let Some(document) = self
                        .repo
                        .get(&orphan.collection, &orphan.fact_id)
                        .map_err(|source| load_error(category, source, result))?
                    else {
                        continue;
                    };
                    let mut data = document.data;
                    data.insert("archivedAt".to_string(), json!(archived_at));
                    data.insert("archiveReason".to_string(), json!("orphaned_container"));
                    data.insert("sourceCollection".to_string(), json!(orphan.collection));
                    let archive = archive_collection(&orphan.collection);
                    writer
                        .push_group(vec![
                            WriteOp::set(&archive, &orphan.fact_id, data),
                            WriteOp::delete(&orphan.collection, &orphan.fact_id),
                        ])
                        .map_err(|source| flush_error(category, source, result))?;
                    facts_archived += 1;
                }
            }
        }
        writer
            .flush()
            .map_err(|source| flush_error(category, source, result))?;
        result.record_facts(facts_deleted, facts_archived);

        // 4. Projections, after duplicates have been resolved.
        let category = RepairCategory::Projections;
        let targets = self
            .projection_targets(diagnosis, &survivors)
            .map_err(|source| load_error(category, source, result))?;
        for (container_id, member_ids) in &targets {
            let mut data = Map::new();
            data.insert(MEMBER_IDS_FIELD.to_string(), json!(member_ids));
            writer
                .push(WriteOp::update(&names.containers, container_id, data))
                .map_err(|source| flush_error(category, source, result))?;
        }
        writer
            .flush()
            .map_err(|source| flush_error(category, source, result))?;
        result.record(category, targets.len());

        Ok(result)
    }

    fn load_relations(&self, scope_id: &str) -> RepoResult<Vec<Relation>> {
        let collection = self.config.collections.relations.as_str();
        self.repo
            .list_all(collection, scope_id)?
            .iter()
            .map(|document| decode_document(collection, document, Relation::from_parts))
            .collect()
    }

    /// Computes the final `memberIds` of every container that needs a rewrite.
    fn projection_targets(
        &self,
        diagnosis: &Diagnosis,
        survivors: &Survivors,
    ) -> RepoResult<BTreeMap<String, Vec<String>>> {
        let keeps = |container_id: &str, member_id: &str| match survivors.get(member_id) {
            Some(survivor) => survivor.as_deref() == Some(container_id),
            None => true,
        };

        let mut targets = BTreeMap::new();
        for projection in &diagnosis.inconsistent_projections {
            let member_ids: BTreeSet<&str> = projection
                .relation_ids
                .iter()
                .map(String::as_str)
                .filter(|member_id| keeps(projection.container_id.as_str(), *member_id))
                .collect();
            targets.insert(
                projection.container_id.clone(),
                member_ids.into_iter().map(str::to_string).collect(),
            );
        }

        // Containers that lost a member to duplicate resolution but were
        // otherwise consistent still cache that member.
        let mut losers: BTreeSet<&str> = BTreeSet::new();
        for assignment in &diagnosis.duplicate_member_assignments {
            let survivor = survivors
                .get(&assignment.member_id)
                .and_then(|survivor| survivor.as_deref());
            losers.extend(
                assignment
                    .container_ids
                    .iter()
                    .map(String::as_str)
                    .filter(|container_id| Some(*container_id) != survivor),
            );
        }
        let containers = self.config.collections.containers.as_str();
        for container_id in losers {
            if targets.contains_key(container_id) {
                continue;
            }
            let Some(document) = self.repo.get(containers, container_id)? else {
                continue;
            };
            let container = decode_document(containers, &document, Container::from_parts)?;
            let member_ids: BTreeSet<&str> = container
                .member_ids
                .iter()
                .map(String::as_str)
                .filter(|member_id| keeps(container_id, *member_id))
                .collect();
            if member_ids.len() == container.member_ids.len() {
                continue;
            }
            targets.insert(
                container_id.to_string(),
                member_ids.into_iter().map(str::to_string).collect(),
            );
        }
        Ok(targets)
    }
}

/// Picks the relation to keep for one conflicted member.
///
/// Returns the survivor (if any candidate is left) and the relations to delete.
fn resolve_duplicate<'a>(
    assignment: &DuplicateMemberAssignment,
    relations: &'a [Relation],
    already_deleted: &HashSet<&str>,
) -> (Option<&'a Relation>, Vec<&'a Relation>) {
    let containers: BTreeSet<&str> = assignment
        .container_ids
        .iter()
        .map(String::as_str)
        .collect();
    let mut candidates: Vec<&Relation> = relations
        .iter()
        .filter(|relation| {
            relation.member_id == assignment.member_id
                && containers.contains(relation.container_id.as_str())
                && !already_deleted.contains(relation.id.as_str())
        })
        .collect();
    candidates.sort_by(|a, b| newest_first(a, b));

    let mut candidates = candidates.into_iter();
    let survivor = candidates.next();
    (survivor, candidates.collect())
}

fn newest_first(a: &Relation, b: &Relation) -> Ordering {
    match (a.created_at, b.created_at) {
        (Some(left), Some(right)) => right.cmp(&left),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

fn flush_error(category: RepairCategory, source: RepoError, completed: RepairResult) -> RepairError {
    RepairError::Flush {
        category,
        source,
        completed,
    }
}

fn load_error(category: RepairCategory, source: RepoError, completed: RepairResult) -> RepairError {
    RepairError::Load {
        category,
        source,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::{newest_first, resolve_duplicate};
    use crate::model::roster::Relation;
    use crate::service::diagnose_service::DuplicateMemberAssignment;
    use std::collections::HashSet;

    fn relation(id: &str, container_id: &str, created_at: Option<i64>) -> Relation {
        Relation {
            id: id.to_string(),
            scope_id: "club".to_string(),
            container_id: container_id.to_string(),
            member_id: "M2".to_string(),
            created_at,
            ..Relation::default()
        }
    }

    fn assignment(container_ids: &[&str]) -> DuplicateMemberAssignment {
        DuplicateMemberAssignment {
            member_id: "M2".to_string(),
            container_ids: container_ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[test]
    fn most_recent_relation_survives() {
        let relations = vec![relation("R1", "T1", Some(1)), relation("R2", "T2", Some(3))];
        let (survivor, losers) =
            resolve_duplicate(&assignment(&["T1", "T2"]), &relations, &HashSet::new());
        assert_eq!(survivor.map(|r| r.id.as_str()), Some("R2"));
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].id, "R1");
    }

    #[test]
    fn equal_timestamps_fall_back_to_lowest_relation_id() {
        let relations = vec![relation("Rb", "T1", Some(5)), relation("Ra", "T2", Some(5))];
        let (survivor, _) =
            resolve_duplicate(&assignment(&["T1", "T2"]), &relations, &HashSet::new());
        assert_eq!(survivor.map(|r| r.id.as_str()), Some("Ra"));
    }

    #[test]
    fn missing_timestamp_ranks_below_any_timestamp() {
        let a = relation("R0", "T1", None);
        let b = relation("R9", "T2", Some(0));
        assert!(newest_first(&b, &a).is_lt());
        assert!(newest_first(&a, &b).is_gt());
    }

    #[test]
    fn already_deleted_relations_are_not_candidates() {
        let relations = vec![relation("R1", "T1", Some(9)), relation("R2", "T2", Some(3))];
        let deleted: HashSet<&str> = ["R1"].into_iter().collect();
        let (survivor, losers) =
            resolve_duplicate(&assignment(&["T1", "T2"]), &relations, &deleted);
        assert_eq!(survivor.map(|r| r.id.as_str()), Some("R2"));
        assert!(losers.is_empty());
    }
}
