//! Container, member, relation and fact records.
//!
//! # Responsibility
//! - Decode schemaless documents into typed records.
//! - Encode records the engine creates (recovered relations, archives).
//!
//! # Invariants
//! - Document identity lives outside the body; `id` is never serialized.
//! - Missing reference fields decode as empty strings, which never match an
//!   existing entity and are therefore reported as orphans.
//! - Timestamps that cannot be read as epoch milliseconds decode as absent
//!   instead of failing the whole document.

use chrono::DateTime;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};

/// Field holding the scoping attribute on every scoped document.
pub const SCOPE_FIELD: &str = "scopeId";
/// Field holding a container's denormalized member-id cache.
pub const MEMBER_IDS_FIELD: &str = "memberIds";
/// Provenance marker stamped on relations rebuilt from fact evidence.
pub const RECOVERED_SOURCE: &str = "recovered";
/// Separator used when rendering a pairing key.
pub const PAIRING_KEY_SEPARATOR: char = '|';

/// The "one" side of the relationship, e.g. a team.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub scope_id: String,
    /// Cached projection of related member ids. Not authoritative.
    #[serde(default)]
    pub member_ids: Vec<String>,
}

/// The "many" side of the relationship, e.g. a shooter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub scope_id: String,
}

/// Explicit join record between one container and one member.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub member_id: String,
    /// Unix epoch milliseconds.
    #[serde(
        default,
        deserialize_with = "lenient_epoch_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<i64>,
    /// `None` or `"app"` for organic relations, `"recovered"` for rebuilt ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_epoch_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub recovered_at: Option<i64>,
}

/// Historical record referencing both a container and a member.
///
/// Only the reference fields are modeled; domain payload stays in the
/// original document and is carried over verbatim when a fact is archived.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub member_id: String,
}

/// Composite `(container, member)` key used for coverage checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairingKey {
    pub container_id: String,
    pub member_id: String,
}

impl PairingKey {
    pub fn new(container_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            member_id: member_id.into(),
        }
    }
}

impl Display for PairingKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{PAIRING_KEY_SEPARATOR}{}",
            self.container_id, self.member_id
        )
    }
}

impl Container {
    pub fn from_parts(id: &str, data: &Map<String, Value>) -> serde_json::Result<Self> {
        let mut container: Self = serde_json::from_value(Value::Object(data.clone()))?;
        container.id = id.to_string();
        Ok(container)
    }
}

impl Member {
    pub fn from_parts(id: &str, data: &Map<String, Value>) -> serde_json::Result<Self> {
        let mut member: Self = serde_json::from_value(Value::Object(data.clone()))?;
        member.id = id.to_string();
        Ok(member)
    }
}

impl Relation {
    pub fn from_parts(id: &str, data: &Map<String, Value>) -> serde_json::Result<Self> {
        let mut relation: Self = serde_json::from_value(Value::Object(data.clone()))?;
        relation.id = id.to_string();
        Ok(relation)
    }

    /// Builds a relation reconstructed from fact evidence.
    pub fn recovered(id: impl Into<String>, scope_id: &str, key: &PairingKey, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            scope_id: scope_id.to_string(),
            container_id: key.container_id.clone(),
            member_id: key.member_id.clone(),
            created_at: Some(now_ms),
            source: Some(RECOVERED_SOURCE.to_string()),
            recovered_at: Some(now_ms),
        }
    }

    /// Returns whether this relation was rebuilt by a recovery pass.
    pub fn is_recovered(&self) -> bool {
        self.source.as_deref() == Some(RECOVERED_SOURCE)
    }

    pub fn key(&self) -> PairingKey {
        PairingKey::new(self.container_id.as_str(), self.member_id.as_str())
    }

    /// Encodes the document body (without identity).
    pub fn to_data(&self) -> serde_json::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "relation encoded to non-object value `{other}`"
            ))),
        }
    }
}

impl Fact {
    pub fn from_parts(id: &str, data: &Map<String, Value>) -> serde_json::Result<Self> {
        let mut fact: Self = serde_json::from_value(Value::Object(data.clone()))?;
        fact.id = id.to_string();
        Ok(fact)
    }

    pub fn key(&self) -> PairingKey {
        PairingKey::new(self.container_id.as_str(), self.member_id.as_str())
    }
}

/// Reads a stored timestamp as Unix epoch milliseconds.
///
/// Accepts integers, finite floats (truncated), RFC 3339 strings, integer
/// strings and `{seconds, nanos}` maps (with or without a leading `_`).
pub fn epoch_ms_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|millis| millis.is_finite())
                .map(|millis| millis.trunc() as i64)
        }),
        Value::String(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .map(|parsed| parsed.timestamp_millis())
                .ok()
                .or_else(|| text.parse::<i64>().ok())
        }
        Value::Object(map) => {
            let seconds = ["seconds", "_seconds"]
                .iter()
                .find_map(|field| map.get(*field))
                .and_then(Value::as_i64)?;
            let nanos = ["nanos", "nanoseconds", "_nanoseconds"]
                .iter()
                .find_map(|field| map.get(*field))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            seconds.checked_mul(1_000)?.checked_add(nanos / 1_000_000)
        }
        _ => None,
    }
}

fn lenient_epoch_ms<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    let millis = epoch_ms_from_value(&value);
    if millis.is_none() {
        warn!(
            "event=timestamp_decode module=model status=warn kind={} action=treat_as_absent",
            value_kind(&value)
        );
    }
    Ok(millis)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::{Container, Fact, PairingKey, Relation, RECOVERED_SOURCE};
    use serde_json::{json, Value};

    fn object(value: Value) -> serde_json::Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn container_without_member_ids_decodes_as_empty_projection() {
        let data = object(json!({ "scopeId": "club-1", "name": "Eagles" }));
        let container = Container::from_parts("T1", &data).unwrap();
        assert_eq!(container.id, "T1");
        assert_eq!(container.scope_id, "club-1");
        assert!(container.member_ids.is_empty());
    }

    #[test]
    fn container_with_wrong_member_ids_type_is_rejected() {
        let data = object(json!({ "scopeId": "club-1", "memberIds": 7 }));
        assert!(Container::from_parts("T1", &data).is_err());
    }

    #[test]
    fn fact_ignores_domain_payload_and_defaults_missing_refs() {
        let data = object(json!({ "scopeId": "club-1", "memberId": "M1", "score": 98.5 }));
        let fact = Fact::from_parts("F1", &data).unwrap();
        assert_eq!(fact.container_id, "");
        assert_eq!(fact.key(), PairingKey::new("", "M1"));
    }

    #[test]
    fn recovered_relation_encodes_provenance_without_identity() {
        let key = PairingKey::new("T9", "M9");
        let relation = Relation::recovered("R-new", "club-1", &key, 1_700_000_000_000);
        assert!(relation.is_recovered());

        let data = relation.to_data().unwrap();
        assert!(!data.contains_key("id"));
        assert_eq!(data["containerId"], json!("T9"));
        assert_eq!(data["memberId"], json!("M9"));
        assert_eq!(data["source"], json!(RECOVERED_SOURCE));
        assert_eq!(data["createdAt"], json!(1_700_000_000_000_i64));
    }

    #[test]
    fn relation_timestamps_decode_from_common_encodings() {
        let cases = [
            (json!(1_709_287_200_000_i64), Some(1_709_287_200_000)),
            (json!(1_709_287_200_000.9_f64), Some(1_709_287_200_000)),
            (json!("2024-03-01T10:00:00Z"), Some(1_709_287_200_000)),
            (json!("2024-03-01T11:00:00+01:00"), Some(1_709_287_200_000)),
            (json!("1709287200000"), Some(1_709_287_200_000)),
            (
                json!({ "seconds": 1_709_287_200_i64, "nanos": 500_000_000 }),
                Some(1_709_287_200_500),
            ),
            (json!({ "_seconds": 1_709_287_200_i64 }), Some(1_709_287_200_000)),
            (json!("last tuesday"), None),
            (json!(true), None),
            (json!(null), None),
        ];
        for (created_at, expected) in cases {
            let data = object(json!({
                "scopeId": "club-1",
                "containerId": "T1",
                "memberId": "M1",
                "createdAt": created_at.clone(),
            }));
            let relation = Relation::from_parts("R1", &data).unwrap();
            assert_eq!(relation.created_at, expected, "{created_at}");
        }
    }

    #[test]
    fn pairing_key_renders_with_separator() {
        assert_eq!(PairingKey::new("T1", "M1").to_string(), "T1|M1");
    }
}
