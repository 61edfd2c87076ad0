//! Document repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Expose collection-scoped reads and batched writes over JSON documents.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - `list_all` returns documents in ascending id order (natural fetch order).
//! - `update` merges top-level fields and fails the batch when the target is
//!   missing; `delete` of a missing document is a no-op.
//! - The `scope_id` column always mirrors the body's `scopeId` field.

use crate::db::migrations::{latest_version, schema_version};
use crate::db::DbError;
use crate::model::roster::SCOPE_FIELD;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Write bound applied when the caller does not configure one.
pub const DEFAULT_MAX_BATCH_OPS: usize = 500;

pub type RepoResult<T> = Result<T, RepoError>;

/// Errors from document store reads and batch commits.
#[derive(Debug)]
pub enum RepoError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// `update` targeted a document that does not exist.
    NotFound { collection: String, id: String },
    /// Batch exceeds the store's atomic write bound.
    BatchTooLarge { len: usize, max: usize },
    /// Persisted document cannot be decoded.
    InvalidData(String),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Store rejected the call without a more specific cause.
    Unavailable(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { collection, id } => {
                write!(f, "document not found: {collection}/{id}")
            }
            Self::BatchTooLarge { len, max } => {
                write!(f, "batch of {len} operations exceeds store limit {max}")
            }
            Self::InvalidData(message) => write!(f, "invalid persisted document: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "document repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::Unavailable(message) => write!(f, "document store unavailable: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// One stored document: identity plus schemaless body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Returns the scoping attribute when present and textual.
    pub fn scope_id(&self) -> Option<&str> {
        self.data.get(SCOPE_FIELD).and_then(Value::as_str)
    }
}

/// One entry of an atomic multi-write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Delete {
        collection: String,
        id: String,
    },
    /// Creates or fully replaces the document body.
    Set {
        collection: String,
        id: String,
        data: Map<String, Value>,
    },
    /// Merges top-level fields into an existing document.
    Update {
        collection: String,
        id: String,
        data: Map<String, Value>,
    },
}

impl WriteOp {
    pub fn delete(collection: &str, id: &str) -> Self {
        Self::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn set(collection: &str, id: &str, data: Map<String, Value>) -> Self {
        Self::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        }
    }

    pub fn update(collection: &str, id: &str, data: Map<String, Value>) -> Self {
        Self::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Self::Delete { collection, .. }
            | Self::Set { collection, .. }
            | Self::Update { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Delete { id, .. } | Self::Set { id, .. } | Self::Update { id, .. } => id,
        }
    }
}

/// Repository interface for the external document store.
pub trait DocumentRepository {
    /// Lists every document in `collection` whose `scopeId` equals `scope_id`.
    fn list_all(&self, collection: &str, scope_id: &str) -> RepoResult<Vec<Document>>;
    /// Loads one document by id.
    fn get(&self, collection: &str, id: &str) -> RepoResult<Option<Document>>;
    /// Applies all operations atomically or none of them.
    fn commit_batch(&self, ops: &[WriteOp]) -> RepoResult<()>;
    /// Maximum operation count accepted by one `commit_batch` call.
    fn max_batch_ops(&self) -> usize;
}

impl<T: DocumentRepository + ?Sized> DocumentRepository for &T {
    fn list_all(&self, collection: &str, scope_id: &str) -> RepoResult<Vec<Document>> {
        (**self).list_all(collection, scope_id)
    }

    fn get(&self, collection: &str, id: &str) -> RepoResult<Option<Document>> {
        (**self).get(collection, id)
    }

    fn commit_batch(&self, ops: &[WriteOp]) -> RepoResult<()> {
        (**self).commit_batch(ops)
    }

    fn max_batch_ops(&self) -> usize {
        (**self).max_batch_ops()
    }
}

/// SQLite-backed document repository.
pub struct SqliteDocumentRepository<'conn> {
    conn: &'conn Connection,
    max_batch_ops: usize,
}

impl<'conn> SqliteDocumentRepository<'conn> {
    /// Creates repository from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_document_connection_ready(conn)?;
        Ok(Self {
            conn,
            max_batch_ops: DEFAULT_MAX_BATCH_OPS,
        })
    }

    /// Overrides the atomic write bound, e.g. to mirror a remote store limit.
    pub fn with_max_batch_ops(mut self, max_batch_ops: usize) -> Self {
        self.max_batch_ops = max_batch_ops.max(1);
        self
    }
}

impl DocumentRepository for SqliteDocumentRepository<'_> {
    fn list_all(&self, collection: &str, scope_id: &str) -> RepoResult<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT doc_id, body
             FROM documents
             WHERE collection = ?1
               AND scope_id = ?2
             ORDER BY doc_id ASC;",
        )?;
        let mut rows = stmt.query(params![collection, scope_id])?;

        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let body: String = row.get(1)?;
            let data = parse_body(collection, &id, &body)?;
            documents.push(Document::new(id, data));
        }
        Ok(documents)
    }

    fn get(&self, collection: &str, id: &str) -> RepoResult<Option<Document>> {
        load_body(self.conn, collection, id)?
            .map(|body| parse_body(collection, id, &body).map(|data| Document::new(id, data)))
            .transpose()
    }

    fn commit_batch(&self, ops: &[WriteOp]) -> RepoResult<()> {
        if ops.len() > self.max_batch_ops {
            return Err(RepoError::BatchTooLarge {
                len: ops.len(),
                max: self.max_batch_ops,
            });
        }
        if ops.is_empty() {
            return Ok(());
        }

        // Dropping the transaction on an early return rolls the whole batch back.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        for op in ops {
            match op {
                WriteOp::Delete { collection, id } => {
                    tx.execute(
                        "DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2;",
                        params![collection, id],
                    )?;
                }
                WriteOp::Set {
                    collection,
                    id,
                    data,
                } => upsert_document(&tx, collection, id, data)?,
                WriteOp::Update {
                    collection,
                    id,
                    data,
                } => {
                    let body = load_body(&tx, collection, id)?.ok_or_else(|| {
                        RepoError::NotFound {
                            collection: collection.clone(),
                            id: id.clone(),
                        }
                    })?;
                    let mut merged = parse_body(collection, id, &body)?;
                    for (field, value) in data {
                        merged.insert(field.clone(), value.clone());
                    }
                    upsert_document(&tx, collection, id, &merged)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}

fn load_body(conn: &Connection, collection: &str, id: &str) -> RepoResult<Option<String>> {
    let body = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND doc_id = ?2;",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(body)
}

fn upsert_document(
    conn: &Connection,
    collection: &str,
    id: &str,
    data: &Map<String, Value>,
) -> RepoResult<()> {
    let scope_id = data.get(SCOPE_FIELD).and_then(Value::as_str);
    let body = serde_json::to_string(data).map_err(|err| {
        RepoError::InvalidData(format!("cannot encode {collection}/{id}: {err}"))
    })?;
    conn.execute(
        "INSERT INTO documents (collection, doc_id, scope_id, body)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, doc_id) DO UPDATE SET
            scope_id = excluded.scope_id,
            body = excluded.body,
            updated_at = (strftime('%s', 'now') * 1000);",
        params![collection, id, scope_id, body],
    )?;
    Ok(())
}

fn parse_body(collection: &str, id: &str, body: &str) -> RepoResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(RepoError::InvalidData(format!(
            "{collection}/{id} body is not a JSON object"
        ))),
        Err(err) => Err(RepoError::InvalidData(format!(
            "{collection}/{id} body is not valid JSON: {err}"
        ))),
    }
}

fn ensure_document_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version = schema_version(conn)?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }
    Ok(())
}
