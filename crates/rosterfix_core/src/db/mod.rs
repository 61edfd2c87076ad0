//! SQLite backing for the bundled document store adapter.
//!
//! The engine itself only sees `DocumentRepository`; this module owns the
//! single `documents` table behind `SqliteDocumentRepository` and its
//! versioned schema.
//!
//! # Invariants
//! - The schema version lives in `PRAGMA user_version`.
//! - A store written by a newer binary is never opened for writing.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

/// Failures while opening or migrating the document store.
#[derive(Debug)]
pub enum DbError {
    /// Connection-level SQLite failure outside any migration step.
    Sqlite(rusqlite::Error),
    /// Store schema was written by a newer binary.
    SchemaTooNew { found: u32, supported: u32 },
    /// One migration step failed; the whole upgrade was rolled back.
    MigrationFailed {
        version: u32,
        name: &'static str,
        source: rusqlite::Error,
    },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "document store sqlite error: {err}"),
            Self::SchemaTooNew { found, supported } => write!(
                f,
                "document store schema v{found} is newer than this binary supports (v{supported})"
            ),
            Self::MigrationFailed {
                version,
                name,
                source,
            } => write!(f, "document store migration v{version} ({name}) failed: {source}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) | Self::MigrationFailed { source: err, .. } => Some(err),
            Self::SchemaTooNew { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
