mod common;

use common::{ids, object, put, OTHER_SCOPE, SCOPE, TEAMS};
use rosterfix_core::db::migrations::latest_version;
use rosterfix_core::db::{open_db, open_db_in_memory, DbError};
use rosterfix_core::{DocumentRepository, RepoError, SqliteDocumentRepository, WriteOp};
use rusqlite::Connection;
use serde_json::json;

#[test]
fn open_db_in_memory_applies_all_migrations() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'documents'
            );",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1);
}

#[test]
fn reopening_file_database_keeps_documents() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roster.sqlite3");

    {
        let conn = open_db(&path).unwrap();
        let repo = SqliteDocumentRepository::try_new(&conn).unwrap();
        put(&repo, TEAMS, "T1", json!({ "scopeId": SCOPE, "memberIds": [] }));
    }

    let conn = open_db(&path).unwrap();
    assert_eq!(schema_version(&conn), latest_version());
    let repo = SqliteDocumentRepository::try_new(&conn).unwrap();
    assert!(repo.get(TEAMS, "T1").unwrap().is_some());
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.sqlite3");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    match open_db(&path).unwrap_err() {
        DbError::SchemaTooNew { found, supported } => {
            assert_eq!(found, 999);
            assert_eq!(supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn repository_rejects_unmigrated_connection() {
    let conn = Connection::open_in_memory().unwrap();
    let err = SqliteDocumentRepository::try_new(&conn).err().unwrap();
    assert!(matches!(
        err,
        RepoError::UninitializedConnection {
            actual_version: 0,
            ..
        }
    ));
}

#[test]
fn list_all_filters_by_scope_and_orders_by_id() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDocumentRepository::try_new(&conn).unwrap();
    put(&repo, TEAMS, "T2", json!({ "scopeId": SCOPE }));
    put(&repo, TEAMS, "T1", json!({ "scopeId": SCOPE }));
    put(&repo, TEAMS, "T3", json!({ "scopeId": OTHER_SCOPE }));
    put(&repo, TEAMS, "T4", json!({ "name": "unscoped" }));

    assert_eq!(ids(&repo, TEAMS, SCOPE), vec!["T1", "T2"]);
    assert_eq!(ids(&repo, TEAMS, OTHER_SCOPE), vec!["T3"]);
}

#[test]
fn update_merges_fields_and_tracks_scope_changes() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDocumentRepository::try_new(&conn).unwrap();
    put(
        &repo,
        TEAMS,
        "T1",
        json!({ "scopeId": SCOPE, "name": "Eagles", "memberIds": ["M1"] }),
    );

    repo.commit_batch(&[WriteOp::update(
        TEAMS,
        "T1",
        object(json!({ "memberIds": ["M2"], "scopeId": OTHER_SCOPE })),
    )])
    .unwrap();

    let document = repo.get(TEAMS, "T1").unwrap().unwrap();
    assert_eq!(document.data["name"], json!("Eagles"));
    assert_eq!(document.data["memberIds"], json!(["M2"]));
    assert!(ids(&repo, TEAMS, SCOPE).is_empty());
    assert_eq!(ids(&repo, TEAMS, OTHER_SCOPE), vec!["T1"]);
}

#[test]
fn failing_operation_rolls_back_the_whole_batch() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDocumentRepository::try_new(&conn).unwrap();
    put(&repo, TEAMS, "T1", json!({ "scopeId": SCOPE }));

    let err = repo
        .commit_batch(&[
            WriteOp::delete(TEAMS, "T1"),
            WriteOp::set(TEAMS, "T2", object(json!({ "scopeId": SCOPE }))),
            WriteOp::update(TEAMS, "missing", object(json!({ "memberIds": [] }))),
        ])
        .unwrap_err();

    assert!(matches!(err, RepoError::NotFound { ref id, .. } if id == "missing"));
    assert_eq!(ids(&repo, TEAMS, SCOPE), vec!["T1"]);
}

#[test]
fn delete_of_missing_document_is_a_noop() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDocumentRepository::try_new(&conn).unwrap();
    repo.commit_batch(&[WriteOp::delete(TEAMS, "ghost")]).unwrap();
    assert!(repo.get(TEAMS, "ghost").unwrap().is_none());
}

#[test]
fn batch_above_store_limit_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteDocumentRepository::try_new(&conn)
        .unwrap()
        .with_max_batch_ops(2);
    assert_eq!(repo.max_batch_ops(), 2);

    let ops: Vec<WriteOp> = (0..3)
        .map(|index| WriteOp::delete(TEAMS, &format!("T{index}")))
        .collect();
    let err = repo.commit_batch(&ops).unwrap_err();
    assert!(matches!(err, RepoError::BatchTooLarge { len: 3, max: 2 }));
}

#[test]
fn corrupt_body_is_reported_as_invalid_data() {
    let conn = open_db_in_memory().unwrap();
    conn.execute(
        "INSERT INTO documents (collection, doc_id, scope_id, body)
         VALUES ('teams', 'T1', 'club-a', 'not json');",
        [],
    )
    .unwrap();
    let repo = SqliteDocumentRepository::try_new(&conn).unwrap();

    assert!(matches!(
        repo.get(TEAMS, "T1").unwrap_err(),
        RepoError::InvalidData(_)
    ));
    assert!(matches!(
        repo.list_all(TEAMS, SCOPE).unwrap_err(),
        RepoError::InvalidData(_)
    ));
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}
