//! `RawBuildRun` — one CI build execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal (and non-terminal) conclusion of a CI build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildConclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
    Neutral,
}

impl BuildConclusion {
    /// Whether this build counts as a positive outcome (`outcome = 1`) for
    /// splitting/stratification purposes. Only `Success` is a 0; everything
    /// else that reached a terminal conclusion is risk-positive (1).
    pub fn outcome_label(self) -> Option<u8> {
        match self {
            BuildConclusion::Success => Some(0),
            BuildConclusion::Failure
            | BuildConclusion::Cancelled
            | BuildConclusion::TimedOut
            | BuildConclusion::ActionRequired => Some(1),
            BuildConclusion::Skipped | BuildConclusion::Neutral => None,
        }
    }
}

/// One CI execution of a workflow on a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBuildRun {
    pub id: Uuid,
    pub raw_repo_id: Uuid,
    /// Unique together with `(raw_repo_id, provider)`.
    pub ci_run_id: String,
    pub provider: String,
    pub build_number: i64,
    pub commit_sha: String,
    /// Defaults to `commit_sha`; overwritten with a synthetic replay SHA by
    /// `create_worktrees_batch` when the original commit is on an
    /// unreachable fork.
    pub effective_sha: String,
    pub branch: String,
    pub status: String,
    pub conclusion: Option<BuildConclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs_metadata: serde_json::Value,
    pub logs_available: bool,
    pub logs_expired: bool,
    pub is_bot_commit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RawBuildRun {
    pub fn new(
        raw_repo_id: Uuid,
        ci_run_id: impl Into<String>,
        provider: impl Into<String>,
        commit_sha: impl Into<String>,
    ) -> Self {
        let commit_sha = commit_sha.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            raw_repo_id,
            ci_run_id: ci_run_id.into(),
            provider: provider.into(),
            build_number: 0,
            effective_sha: commit_sha.clone(),
            commit_sha,
            branch: String::new(),
            status: "queued".to_string(),
            conclusion: None,
            started_at: None,
            completed_at: None,
            jobs_metadata: serde_json::Value::Null,
            logs_available: false,
            logs_expired: false,
            is_bot_commit: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a successful fork-commit replay: the worktree for this build
    /// must be checked out at `replay_sha`, not `commit_sha`.
    pub fn set_effective_sha(&mut self, replay_sha: impl Into<String>) {
        self.effective_sha = replay_sha.into();
    }

    pub fn short_sha(&self) -> &str {
        let n = self.effective_sha.len().min(12);
        &self.effective_sha[..n]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_sha_defaults_to_commit_sha() {
        let build = RawBuildRun::new(Uuid::new_v4(), "run-1", "github_actions", "abc123");
        assert_eq!(build.effective_sha, build.commit_sha);
    }

    #[test]
    fn set_effective_sha_overrides_without_touching_commit_sha() {
        let mut build = RawBuildRun::new(Uuid::new_v4(), "run-1", "github_actions", "abc123");
        build.set_effective_sha("def456");
        assert_eq!(build.effective_sha, "def456");
        assert_eq!(build.commit_sha, "abc123");
    }

    #[test]
    fn outcome_label_maps_success_to_zero_and_failure_to_one() {
        assert_eq!(BuildConclusion::Success.outcome_label(), Some(0));
        assert_eq!(BuildConclusion::Failure.outcome_label(), Some(1));
        assert_eq!(BuildConclusion::Skipped.outcome_label(), None);
    }

    #[test]
    fn short_sha_truncates_to_twelve_chars() {
        let build = RawBuildRun::new(
            Uuid::new_v4(),
            "run-1",
            "github_actions",
            "0123456789abcdef",
        );
        assert_eq!(build.short_sha(), "0123456789ab");
    }
}
