//! In-memory document store used to exercise the engine without SQLite.
//!
//! # Responsibility
//! - Mirror `SqliteDocumentRepository` semantics (ordering, merge, atomicity).
//! - Count commits and written operations so callers can assert write volume.
//! - Inject read and commit failures on demand.
//!
//! # Invariants
//! - Seeding through `insert` never counts as a commit.
//! - A failed commit leaves every collection unchanged.

use crate::model::roster::SCOPE_FIELD;
use crate::repo::document_repo::{
    Document, DocumentRepository, RepoError, RepoResult, WriteOp, DEFAULT_MAX_BATCH_OPS,
};
use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

type Collections = BTreeMap<String, BTreeMap<String, Map<String, Value>>>;

/// Single-threaded fake of the external document store.
#[derive(Debug)]
pub struct InMemoryDocumentRepository {
    collections: RefCell<Collections>,
    max_batch_ops: usize,
    commits: Cell<usize>,
    ops_written: Cell<usize>,
    commits_before_failure: Cell<Option<usize>>,
    failing_reads: RefCell<BTreeSet<String>>,
}

impl Default for InMemoryDocumentRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self {
            collections: RefCell::new(BTreeMap::new()),
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
            commits: Cell::new(0),
            ops_written: Cell::new(0),
            commits_before_failure: Cell::new(None),
            failing_reads: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn with_max_batch_ops(mut self, max_batch_ops: usize) -> Self {
        self.max_batch_ops = max_batch_ops.max(1);
        self
    }

    /// Seeds one document without counting a commit.
    pub fn insert(&self, collection: &str, id: &str, data: Map<String, Value>) {
        self.collections
            .borrow_mut()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
    }

    /// Removes one document without counting a commit.
    pub fn remove(&self, collection: &str, id: &str) {
        if let Some(documents) = self.collections.borrow_mut().get_mut(collection) {
            documents.remove(id);
        }
    }

    /// Returns a copy of one document body.
    pub fn document(&self, collection: &str, id: &str) -> Option<Map<String, Value>> {
        self.collections
            .borrow()
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned()
    }

    /// Returns all document ids of one collection, across every scope.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.collections
            .borrow()
            .get(collection)
            .map(|documents| documents.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of successful `commit_batch` calls.
    pub fn commit_count(&self) -> usize {
        self.commits.get()
    }

    /// Number of operations applied by successful commits.
    pub fn ops_written(&self) -> usize {
        self.ops_written.get()
    }

    /// Lets `successful_commits` more commits through, then fails every later one.
    pub fn fail_commits_after(&self, successful_commits: usize) {
        self.commits_before_failure.set(Some(successful_commits));
    }

    /// Makes every `list_all` on `collection` fail.
    pub fn fail_reads_on(&self, collection: &str) {
        self.failing_reads
            .borrow_mut()
            .insert(collection.to_string());
    }

    fn check_read(&self, collection: &str) -> RepoResult<()> {
        if self.failing_reads.borrow().contains(collection) {
            return Err(RepoError::Unavailable(format!(
                "injected read failure on `{collection}`"
            )));
        }
        Ok(())
    }
}

impl DocumentRepository for InMemoryDocumentRepository {
    fn list_all(&self, collection: &str, scope_id: &str) -> RepoResult<Vec<Document>> {
        self.check_read(collection)?;
        let collections = self.collections.borrow();
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(documents
            .iter()
            .filter(|(_, data)| data.get(SCOPE_FIELD).and_then(Value::as_str) == Some(scope_id))
            .map(|(id, data)| Document::new(id.as_str(), data.clone()))
            .collect())
    }

    fn get(&self, collection: &str, id: &str) -> RepoResult<Option<Document>> {
        self.check_read(collection)?;
        Ok(self
            .document(collection, id)
            .map(|data| Document::new(id, data)))
    }

    fn commit_batch(&self, ops: &[WriteOp]) -> RepoResult<()> {
        if ops.len() > self.max_batch_ops {
            return Err(RepoError::BatchTooLarge {
                len: ops.len(),
                max: self.max_batch_ops,
            });
        }
        if let Some(remaining) = self.commits_before_failure.get() {
            if remaining == 0 {
                return Err(RepoError::Unavailable(
                    "injected commit failure".to_string(),
                ));
            }
            self.commits_before_failure.set(Some(remaining - 1));
        }

        let mut staged = self.collections.borrow().clone();
        for op in ops {
            match op {
                WriteOp::Delete { collection, id } => {
                    if let Some(documents) = staged.get_mut(collection) {
                        documents.remove(id);
                    }
                }
                WriteOp::Set {
                    collection,
                    id,
                    data,
                } => {
                    staged
                        .entry(collection.clone())
                        .or_default()
                        .insert(id.clone(), data.clone());
                }
                WriteOp::Update {
                    collection,
                    id,
                    data,
                } => {
                    let existing = staged
                        .get_mut(collection)
                        .and_then(|documents| documents.get_mut(id))
                        .ok_or_else(|| RepoError::NotFound {
                            collection: collection.clone(),
                            id: id.clone(),
                        })?;
                    for (field, value) in data {
                        existing.insert(field.clone(), value.clone());
                    }
                }
            }
        }

        *self.collections.borrow_mut() = staged;
        self.commits.set(self.commits.get() + 1);
        self.ops_written.set(self.ops_written.get() + ops.len());
        Ok(())
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryDocumentRepository;
    use crate::repo::document_repo::{DocumentRepository, RepoError, WriteOp};
    use serde_json::{json, Map, Value};

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn list_all_filters_by_scope_in_id_order() {
        let repo = InMemoryDocumentRepository::new();
        repo.insert("teams", "b", object(json!({ "scopeId": "A" })));
        repo.insert("teams", "a", object(json!({ "scopeId": "A" })));
        repo.insert("teams", "c", object(json!({ "scopeId": "B" })));

        let ids: Vec<String> = repo
            .list_all("teams", "A")
            .unwrap()
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn update_of_missing_document_rolls_back_whole_batch() {
        let repo = InMemoryDocumentRepository::new();
        repo.insert("teams", "T1", object(json!({ "scopeId": "A" })));

        let err = repo
            .commit_batch(&[
                WriteOp::delete("teams", "T1"),
                WriteOp::update("teams", "missing", object(json!({ "memberIds": [] }))),
            ])
            .unwrap_err();
        assert!(matches!(err, RepoError::NotFound { .. }));
        assert!(repo.document("teams", "T1").is_some());
        assert_eq!(repo.commit_count(), 0);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let repo = InMemoryDocumentRepository::new().with_max_batch_ops(1);
        let err = repo
            .commit_batch(&[WriteOp::delete("a", "1"), WriteOp::delete("a", "2")])
            .unwrap_err();
        assert!(matches!(err, RepoError::BatchTooLarge { len: 2, max: 1 }));
    }

    #[test]
    fn injected_commit_failure_triggers_after_budget() {
        let repo = InMemoryDocumentRepository::new();
        repo.fail_commits_after(1);
        repo.commit_batch(&[WriteOp::delete("a", "1")]).unwrap();
        assert!(repo.commit_batch(&[WriteOp::delete("a", "2")]).is_err());
        assert_eq!(repo.commit_count(), 1);
    }
}
