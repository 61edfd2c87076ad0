//! Versioned schema steps for the `documents` table.
//!
//! Steps run in ascending version order inside one transaction, so a store
//! is either fully upgraded or left at its previous version.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

/// One schema step, identified by the `user_version` it leaves behind.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const DOCUMENT_STORE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "documents",
        sql: include_str!("0001_documents.sql"),
    },
    Migration {
        version: 2,
        name: "scope_index",
        sql: include_str!("0002_scope_index.sql"),
    },
];

/// Schema version a fully migrated document store reports.
pub fn latest_version() -> u32 {
    DOCUMENT_STORE_MIGRATIONS
        .last()
        .map_or(0, |migration| migration.version)
}

/// Reads the schema version currently recorded in the store.
pub fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?)
}

/// Brings the document store up to `latest_version()`.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    apply_steps(conn, DOCUMENT_STORE_MIGRATIONS)
}

pub(crate) fn apply_steps(conn: &mut Connection, steps: &[Migration]) -> DbResult<()> {
    let found = schema_version(conn)?;
    let supported = steps.last().map_or(0, |step| step.version);
    if found > supported {
        return Err(DbError::SchemaTooNew { found, supported });
    }

    let pending: Vec<&Migration> = steps.iter().filter(|step| step.version > found).collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for step in pending {
        tx.execute_batch(step.sql)
            .and_then(|()| tx.execute_batch(&format!("PRAGMA user_version = {};", step.version)))
            .map_err(|source| DbError::MigrationFailed {
                version: step.version,
                name: step.name,
                source,
            })?;
        info!(
            "event=db_migrate module=db status=ok version={} name={}",
            step.version, step.name
        );
    }
    tx.commit()?;
    Ok(())
}
