//! Engine configuration.
//!
//! # Responsibility
//! - Name the collections the engine reconciles.
//! - Bound batched writes and pick the orphaned-fact policy.
//!
//! # Invariants
//! - A validated config has distinct, well-formed collection names, at least
//!   one fact collection, and `0 < flush_threshold <= max_ops`.
//! - The core never reads configuration from disk; callers deserialize it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

static COLLECTION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("valid collection name regex"));

const ARCHIVE_SUFFIX: &str = "_archive";

/// What to do with facts whose container no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanFactPolicy {
    /// Remove the fact permanently.
    #[default]
    Delete,
    /// Copy the fact to `<collection>_archive`, then remove the original.
    Archive,
}

/// Collection names for the four roster entity kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectionNames {
    pub containers: String,
    pub members: String,
    pub relations: String,
    /// Every fact-bearing collection checked for orphans and used as evidence.
    pub facts: Vec<String>,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            containers: "teams".to_string(),
            members: "shooters".to_string(),
            relations: "team_members".to_string(),
            facts: vec!["scores".to_string()],
        }
    }
}

/// Bounds for batched atomic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchLimits {
    /// Hard operation limit of one atomic multi-write.
    pub max_ops: usize,
    /// Buffer size at which a flush is forced.
    pub flush_threshold: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_ops: 500,
            flush_threshold: 450,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub collections: CollectionNames,
    pub batch: BatchLimits,
    pub orphan_fact_policy: OrphanFactPolicy,
}

/// Configuration parse/validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    InvalidCollectionName(String),
    DuplicateCollectionName(String),
    MissingFactCollection,
    InvalidBatchLimits { max_ops: usize, flush_threshold: usize },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(message) => write!(f, "invalid engine config: {message}"),
            Self::InvalidCollectionName(name) => {
                write!(f, "collection name is invalid: `{name}`")
            }
            Self::DuplicateCollectionName(name) => {
                write!(f, "collection name is used twice: `{name}`")
            }
            Self::MissingFactCollection => write!(f, "at least one fact collection is required"),
            Self::InvalidBatchLimits {
                max_ops,
                flush_threshold,
            } => write!(
                f,
                "batch limits require 0 < flush_threshold <= max_ops, got {flush_threshold} and {max_ops}"
            ),
        }
    }
}

impl Error for ConfigError {}

impl EngineConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(value: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(value).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let names = &self.collections;
        if names.facts.is_empty() {
            return Err(ConfigError::MissingFactCollection);
        }

        let mut seen = BTreeSet::new();
        let all = [&names.containers, &names.members, &names.relations]
            .into_iter()
            .chain(names.facts.iter());
        for name in all {
            if !COLLECTION_NAME_RE.is_match(name) {
                return Err(ConfigError::InvalidCollectionName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateCollectionName(name.clone()));
            }
        }
        if self.orphan_fact_policy == OrphanFactPolicy::Archive {
            for fact in &names.facts {
                let archive = archive_collection(fact);
                if seen.contains(archive.as_str()) {
                    return Err(ConfigError::DuplicateCollectionName(archive));
                }
            }
        }

        let BatchLimits {
            max_ops,
            flush_threshold,
        } = self.batch;
        let min_ops = match self.orphan_fact_policy {
            OrphanFactPolicy::Delete => 1,
            // The archive copy and the source deletion share one commit.
            OrphanFactPolicy::Archive => 2,
        };
        if flush_threshold == 0 || flush_threshold > max_ops || max_ops < min_ops {
            return Err(ConfigError::InvalidBatchLimits {
                max_ops,
                flush_threshold,
            });
        }
        Ok(())
    }
}

/// Returns the archive collection paired with a fact collection.
pub fn archive_collection(fact_collection: &str) -> String {
    format!("{fact_collection}{ARCHIVE_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::{archive_collection, ConfigError, EngineConfig, OrphanFactPolicy};

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config = EngineConfig::from_json_str(
            r#"{ "collections": { "facts": ["scores", "trainings"] }, "orphanFactPolicy": "archive" }"#,
        )
        .unwrap();
        assert_eq!(config.collections.containers, "teams");
        assert_eq!(config.collections.facts.len(), 2);
        assert_eq!(config.orphan_fact_policy, OrphanFactPolicy::Archive);
        assert_eq!(config.batch.max_ops, 500);
    }

    #[test]
    fn rejects_threshold_above_max() {
        let err = EngineConfig::from_json_str(r#"{ "batch": { "maxOps": 10, "flushThreshold": 11 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBatchLimits { .. }));
    }

    #[test]
    fn archive_policy_needs_room_for_copy_and_delete() {
        let err = EngineConfig::from_json_str(
            r#"{ "batch": { "maxOps": 1, "flushThreshold": 1 }, "orphanFactPolicy": "archive" }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBatchLimits { max_ops: 1, .. }));

        EngineConfig::from_json_str(r#"{ "batch": { "maxOps": 1, "flushThreshold": 1 } }"#)
            .unwrap();
    }

    #[test]
    fn rejects_duplicate_and_malformed_names() {
        let mut config = EngineConfig::default();
        config.collections.members = "teams".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateCollectionName(name)) if name == "teams"
        ));

        let mut config = EngineConfig::default();
        config.collections.relations = "Team Members".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCollectionName(_))
        ));
    }

    #[test]
    fn archive_collection_appends_suffix() {
        assert_eq!(archive_collection("scores"), "scores_archive");
    }
}
