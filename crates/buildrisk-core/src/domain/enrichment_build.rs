//! `EnrichmentBuild` — per-build tracking record in the processing phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    InProgress,
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitAssignment {
    Train,
    Validation,
    Test,
}

/// One build's progress through the Feature DAG Engine, carrying the
/// temporal-ordering key (`build_started_at`) that Phase 3 sorts on so
/// history-dependent features observe consistent prior state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentBuild {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub ingestion_build_id: Uuid,
    pub raw_repo_id: Uuid,
    pub raw_build_run_id: Uuid,
    pub feature_vector_id: Option<Uuid>,
    pub extraction_status: ExtractionStatus,
    pub error: Option<String>,
    pub split_assignment: Option<SplitAssignment>,
    pub group_value: Option<String>,
    pub outcome: Option<u8>,
    pub commit_sha: String,
    pub ci_run_id: String,
    pub build_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnrichmentBuild {
    pub fn new(
        scenario_id: Uuid,
        ingestion_build_id: Uuid,
        raw_repo_id: Uuid,
        raw_build_run_id: Uuid,
        commit_sha: impl Into<String>,
        ci_run_id: impl Into<String>,
        build_started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scenario_id,
            ingestion_build_id,
            raw_repo_id,
            raw_build_run_id,
            feature_vector_id: None,
            extraction_status: ExtractionStatus::Pending,
            error: None,
            split_assignment: None,
            group_value: None,
            outcome: None,
            commit_sha: commit_sha.into(),
            ci_run_id: ci_run_id.into(),
            build_started_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete(&mut self, feature_vector_id: Uuid, partial: bool, at: DateTime<Utc>) {
        self.feature_vector_id = Some(feature_vector_id);
        self.extraction_status = if partial {
            ExtractionStatus::Partial
        } else {
            ExtractionStatus::Completed
        };
        self.updated_at = at;
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.extraction_status = ExtractionStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = at;
    }

    pub fn assign_split(&mut self, split: SplitAssignment, group_value: impl Into<String>) {
        self.split_assignment = Some(split);
        self.group_value = Some(group_value.into());
    }

    /// Whether this build has a usable feature vector for the split phase.
    pub fn has_feature_vector(&self) -> bool {
        self.feature_vector_id.is_some()
            && matches!(
                self.extraction_status,
                ExtractionStatus::Completed | ExtractionStatus::Partial
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EnrichmentBuild {
        EnrichmentBuild::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "abc123",
            "run-1",
            Utc::now(),
        )
    }

    #[test]
    fn new_starts_pending_with_no_feature_vector() {
        let build = sample();
        assert_eq!(build.extraction_status, ExtractionStatus::Pending);
        assert!(!build.has_feature_vector());
    }

    #[test]
    fn complete_marks_completed_when_not_partial() {
        let mut build = sample();
        build.complete(Uuid::new_v4(), false, Utc::now());
        assert_eq!(build.extraction_status, ExtractionStatus::Completed);
        assert!(build.has_feature_vector());
    }

    #[test]
    fn partial_completion_still_usable_for_split() {
        let mut build = sample();
        build.complete(Uuid::new_v4(), true, Utc::now());
        assert_eq!(build.extraction_status, ExtractionStatus::Partial);
        assert!(build.has_feature_vector());
    }

    #[test]
    fn failed_build_has_no_feature_vector_for_split() {
        let mut build = sample();
        build.fail("node panicked", Utc::now());
        assert!(!build.has_feature_vector());
        assert_eq!(build.error.as_deref(), Some("node panicked"));
    }

    #[test]
    fn assign_split_sets_both_fields() {
        let mut build = sample();
        build.assign_split(SplitAssignment::Test, "rust");
        assert_eq!(build.split_assignment, Some(SplitAssignment::Test));
        assert_eq!(build.group_value.as_deref(), Some("rust"));
    }
}
