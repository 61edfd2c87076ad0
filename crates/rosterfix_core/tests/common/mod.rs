#![allow(dead_code)]

use rosterfix_core::{Document, DocumentRepository, InMemoryDocumentRepository, WriteOp};
use serde_json::{json, Map, Value};

pub const SCOPE: &str = "club-a";
pub const OTHER_SCOPE: &str = "club-b";
pub const TEAMS: &str = "teams";
pub const SHOOTERS: &str = "shooters";
pub const TEAM_MEMBERS: &str = "team_members";
pub const SCORES: &str = "scores";
pub const DAY_MS: i64 = 86_400_000;

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture must be an object, got {other}"),
    }
}

pub fn team(scope: &str, member_ids: &[&str]) -> Value {
    json!({ "scopeId": scope, "name": "team", "memberIds": member_ids })
}

pub fn shooter(scope: &str) -> Value {
    json!({ "scopeId": scope, "displayName": "shooter" })
}

pub fn relation(scope: &str, container_id: &str, member_id: &str, created_at: Option<i64>) -> Value {
    let mut value = json!({
        "scopeId": scope,
        "containerId": container_id,
        "memberId": member_id,
    });
    if let Some(created_at) = created_at {
        value["createdAt"] = json!(created_at);
    }
    value
}

pub fn score(scope: &str, container_id: &str, member_id: &str) -> Value {
    json!({
        "scopeId": scope,
        "containerId": container_id,
        "memberId": member_id,
        "points": 97.5,
    })
}

/// Writes one document through the store's batch primitive.
pub fn put<R: DocumentRepository>(repo: &R, collection: &str, id: &str, value: Value) {
    repo.commit_batch(&[WriteOp::set(collection, id, object(value))])
        .unwrap();
}

/// Seeds one document into the fake store without counting a commit.
pub fn seed(repo: &InMemoryDocumentRepository, collection: &str, id: &str, value: Value) {
    repo.insert(collection, id, object(value));
}

pub fn member_ids<R: DocumentRepository>(repo: &R, team_id: &str) -> Vec<String> {
    let document = repo.get(TEAMS, team_id).unwrap().expect("team should exist");
    document.data["memberIds"]
        .as_array()
        .expect("memberIds should be an array")
        .iter()
        .map(|value| value.as_str().unwrap().to_string())
        .collect()
}

pub fn ids<R: DocumentRepository>(repo: &R, collection: &str, scope: &str) -> Vec<String> {
    repo.list_all(collection, scope)
        .unwrap()
        .into_iter()
        .map(|document| document.id)
        .collect()
}

/// Full contents of the default collections for one scope.
pub fn dump<R: DocumentRepository>(repo: &R, scope: &str) -> Vec<(String, Vec<Document>)> {
    [TEAMS, SHOOTERS, TEAM_MEMBERS, SCORES]
        .into_iter()
        .map(|collection| {
            (
                collection.to_string(),
                repo.list_all(collection, scope).unwrap(),
            )
        })
        .collect()
}
