//! Point-in-time scope snapshot shared by the read-side passes.
//!
//! # Responsibility
//! - Load containers, members, relations and every fact collection of one
//!   scope, failing fast on the first store or decode error.
//! - Build the existence sets and relation indexes in a single pass.
//!
//! # Invariants
//! - A relation is valid only when both of its ends exist in the snapshot.
//! - Index lookups never rescan a collection.

use crate::config::CollectionNames;
use crate::model::roster::{Container, Fact, Member, PairingKey, Relation};
use crate::repo::document_repo::{Document, DocumentRepository, RepoError, RepoResult};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Facts loaded from one fact-bearing collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactCollection {
    pub collection: String,
    pub facts: Vec<Fact>,
}

/// All in-scope records needed by one consistency pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSnapshot {
    pub scope_id: String,
    pub containers: Vec<Container>,
    pub members: Vec<Member>,
    pub relations: Vec<Relation>,
    pub fact_collections: Vec<FactCollection>,
}

impl ScopeSnapshot {
    /// Loads every collection named in `names` for `scope_id`.
    pub fn load<R: DocumentRepository + ?Sized>(
        repo: &R,
        names: &CollectionNames,
        scope_id: &str,
    ) -> RepoResult<Self> {
        let containers = load_decoded(repo, &names.containers, scope_id, Container::from_parts)?;
        let members = load_decoded(repo, &names.members, scope_id, Member::from_parts)?;
        let relations = load_decoded(repo, &names.relations, scope_id, Relation::from_parts)?;

        let mut fact_collections = Vec::with_capacity(names.facts.len());
        for collection in &names.facts {
            fact_collections.push(FactCollection {
                collection: collection.clone(),
                facts: load_decoded(repo, collection, scope_id, Fact::from_parts)?,
            });
        }

        Ok(Self {
            scope_id: scope_id.to_string(),
            containers,
            members,
            relations,
            fact_collections,
        })
    }

    pub fn index(&self) -> SnapshotIndex<'_> {
        SnapshotIndex::build(self)
    }

    pub fn fact_count(&self) -> usize {
        self.fact_collections
            .iter()
            .map(|collection| collection.facts.len())
            .sum()
    }
}

/// Lookup structures derived from a snapshot in one pass.
#[derive(Debug)]
pub struct SnapshotIndex<'a> {
    pub container_ids: HashSet<&'a str>,
    pub member_ids: HashSet<&'a str>,
    /// Valid relations, in snapshot order.
    pub valid_relations: Vec<&'a Relation>,
    /// `memberId -> [containerId]` over valid relations.
    pub containers_by_member: BTreeMap<&'a str, Vec<&'a str>>,
    /// `containerId -> {memberId}` over valid relations.
    pub members_by_container: BTreeMap<&'a str, BTreeSet<&'a str>>,
    /// Keys of every valid relation.
    pub covered: HashSet<PairingKey>,
}

impl<'a> SnapshotIndex<'a> {
    fn build(snapshot: &'a ScopeSnapshot) -> Self {
        let container_ids: HashSet<&str> = snapshot
            .containers
            .iter()
            .map(|container| container.id.as_str())
            .collect();
        let member_ids: HashSet<&str> = snapshot
            .members
            .iter()
            .map(|member| member.id.as_str())
            .collect();

        let mut valid_relations = Vec::new();
        let mut containers_by_member: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut members_by_container: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut covered = HashSet::new();
        for relation in &snapshot.relations {
            if !container_ids.contains(relation.container_id.as_str())
                || !member_ids.contains(relation.member_id.as_str())
            {
                continue;
            }
            valid_relations.push(relation);
            containers_by_member
                .entry(relation.member_id.as_str())
                .or_default()
                .push(relation.container_id.as_str());
            members_by_container
                .entry(relation.container_id.as_str())
                .or_default()
                .insert(relation.member_id.as_str());
            covered.insert(relation.key());
        }

        Self {
            container_ids,
            member_ids,
            valid_relations,
            containers_by_member,
            members_by_container,
            covered,
        }
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.container_ids.contains(id)
    }

    pub fn has_member(&self, id: &str) -> bool {
        self.member_ids.contains(id)
    }

    pub fn is_valid(&self, relation: &Relation) -> bool {
        self.has_container(&relation.container_id) && self.has_member(&relation.member_id)
    }

    /// Members with a valid relation to `container_id`, sorted.
    pub fn members_of(&self, container_id: &str) -> BTreeSet<&'a str> {
        self.members_by_container
            .get(container_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn load_decoded<R, T>(
    repo: &R,
    collection: &str,
    scope_id: &str,
    decode: fn(&str, &Map<String, Value>) -> serde_json::Result<T>,
) -> RepoResult<Vec<T>>
where
    R: DocumentRepository + ?Sized,
{
    repo.list_all(collection, scope_id)?
        .iter()
        .map(|document| decode_document(collection, document, decode))
        .collect()
}

pub(crate) fn decode_document<T>(
    collection: &str,
    document: &Document,
    decode: fn(&str, &Map<String, Value>) -> serde_json::Result<T>,
) -> RepoResult<T> {
    decode(&document.id, &document.data)
        .map_err(|err| RepoError::InvalidData(format!("{collection}/{}: {err}", document.id)))
}
