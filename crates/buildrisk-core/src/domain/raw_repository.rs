//! `RawRepository` — canonical record of a source-code repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical record of a repository tracked by the platform.
///
/// Immutable after first upsert except for `metadata` refresh; owned by
/// nobody and referenced by every other entity via `raw_repo_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRepository {
    pub id: Uuid,
    /// `owner/repo`, unique.
    pub full_name: String,
    pub external_repo_id: String,
    pub default_branch: String,
    pub is_private: bool,
    pub primary_language: Option<String>,
    /// Opaque, provider-specific metadata (never interpreted by the core).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RawRepository {
    pub fn new(full_name: impl Into<String>, external_repo_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            full_name: full_name.into(),
            external_repo_id: external_repo_id.into(),
            default_branch: "main".to_string(),
            is_private: false,
            primary_language: None,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh provider metadata in place; all other fields are immutable
    /// after first upsert.
    pub fn refresh_metadata(&mut self, metadata: serde_json::Value, at: DateTime<Utc>) {
        self.metadata = metadata;
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_to_main_branch_and_public() {
        let repo = RawRepository::new("org/repo", "12345");
        assert_eq!(repo.default_branch, "main");
        assert!(!repo.is_private);
        assert_eq!(repo.full_name, "org/repo");
    }

    #[test]
    fn refresh_metadata_updates_timestamp_only() {
        let mut repo = RawRepository::new("org/repo", "12345");
        let original_name = repo.full_name.clone();
        let later = repo.updated_at + chrono::Duration::seconds(5);
        repo.refresh_metadata(serde_json::json!({"stars": 10}), later);
        assert_eq!(repo.full_name, original_name);
        assert_eq!(repo.updated_at, later);
        assert_eq!(repo.metadata["stars"], 10);
    }
}
