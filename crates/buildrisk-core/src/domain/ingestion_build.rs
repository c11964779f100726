//! `IngestionBuild` — per-scenario, per-build record of raw-resource
//! acquisition (git clone, working-tree checkout, CI job logs).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The resource-acquisition tasks the Resource DAG (C3) can schedule.
/// `git_worktree` depends on `git_history`; `build_logs` has no git
/// dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceName {
    GitHistory,
    GitWorktree,
    BuildLogs,
}

impl ResourceName {
    pub const ALL: [ResourceName; 3] = [
        ResourceName::GitHistory,
        ResourceName::GitWorktree,
        ResourceName::BuildLogs,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub status: ResourceStatus,
    pub error: Option<String>,
    /// Set when a `Failed` resource is an expected loss (e.g. expired CI
    /// logs) rather than a transient error that merits retry.
    pub expected_loss: bool,
    pub updated_at: DateTime<Utc>,
}

impl ResourceEntry {
    fn pending(at: DateTime<Utc>) -> Self {
        Self {
            status: ResourceStatus::Pending,
            error: None,
            expected_loss: false,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Ingesting,
    Ingested,
    MissingResource,
    Failed,
}

/// Tracks acquisition of the required resources for one build within one
/// scenario run. A build reaches `ingested` iff every resource in
/// `required_resources` is `completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionBuild {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub raw_repo_id: Uuid,
    pub raw_build_run_id: Uuid,
    pub status: IngestionStatus,
    pub required_resources: Vec<ResourceName>,
    pub resource_status: BTreeMap<ResourceName, ResourceEntry>,
    pub commit_sha: String,
    pub ci_run_id: String,
    pub build_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionBuild {
    pub fn new(
        scenario_id: Uuid,
        raw_repo_id: Uuid,
        raw_build_run_id: Uuid,
        commit_sha: impl Into<String>,
        ci_run_id: impl Into<String>,
        required_resources: Vec<ResourceName>,
    ) -> Self {
        let now = Utc::now();
        let resource_status = required_resources
            .iter()
            .copied()
            .map(|name| (name, ResourceEntry::pending(now)))
            .collect();
        Self {
            id: Uuid::new_v4(),
            scenario_id,
            raw_repo_id,
            raw_build_run_id,
            status: IngestionStatus::Pending,
            required_resources,
            resource_status,
            commit_sha: commit_sha.into(),
            ci_run_id: ci_run_id.into(),
            build_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_resource(
        &mut self,
        name: ResourceName,
        status: ResourceStatus,
        error: Option<String>,
        expected_loss: bool,
        at: DateTime<Utc>,
    ) {
        let entry = self
            .resource_status
            .entry(name)
            .or_insert_with(|| ResourceEntry::pending(at));
        entry.status = status;
        entry.error = error;
        entry.expected_loss = expected_loss;
        entry.updated_at = at;
        self.updated_at = at;
        self.recompute_status();
    }

    /// Mark every resource owned by a repo-wide clone failure as a missing
    /// resource, per the Phase 2 callback's clone-level failure handling.
    pub fn mark_missing_resource(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        let reason = reason.into();
        let names: Vec<ResourceName> = self.required_resources.clone();
        for name in names {
            self.record_resource(name, ResourceStatus::Failed, Some(reason.clone()), true, at);
        }
    }

    fn recompute_status(&mut self) {
        let entries: Vec<&ResourceEntry> = self.resource_status.values().collect();
        if entries
            .iter()
            .any(|e| e.status == ResourceStatus::Failed && !e.expected_loss)
        {
            self.status = IngestionStatus::Failed;
            return;
        }
        if entries.iter().any(|e| e.status == ResourceStatus::Failed && e.expected_loss) {
            self.status = IngestionStatus::MissingResource;
            return;
        }
        if entries
            .iter()
            .any(|e| matches!(e.status, ResourceStatus::Pending | ResourceStatus::InProgress))
        {
            self.status = IngestionStatus::Ingesting;
            return;
        }
        self.status = IngestionStatus::Ingested;
    }

    /// Reset to phase-entry state for `ReingestMissingResource`: all
    /// resources go back to `Pending` unconditionally, including ones
    /// previously marked an expected loss.
    pub fn reset_for_reingestion(&mut self, at: DateTime<Utc>) {
        for entry in self.resource_status.values_mut() {
            *entry = ResourceEntry::pending(at);
        }
        self.status = IngestionStatus::Pending;
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> IngestionBuild {
        IngestionBuild::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "abc123",
            "run-1",
            ResourceName::ALL.to_vec(),
        )
    }

    #[test]
    fn new_seeds_required_resources_pending() {
        let b = build();
        assert_eq!(b.resource_status.len(), 3);
        assert_eq!(b.status, IngestionStatus::Pending);
    }

    #[test]
    fn all_completed_yields_ingested() {
        let mut b = build();
        let now = Utc::now();
        for name in ResourceName::ALL {
            b.record_resource(name, ResourceStatus::Completed, None, false, now);
        }
        assert_eq!(b.status, IngestionStatus::Ingested);
    }

    #[test]
    fn expected_loss_failure_yields_missing_resource_not_failed() {
        let mut b = build();
        let now = Utc::now();
        b.record_resource(ResourceName::GitHistory, ResourceStatus::Completed, None, false, now);
        b.record_resource(ResourceName::GitWorktree, ResourceStatus::Completed, None, false, now);
        b.record_resource(
            ResourceName::BuildLogs,
            ResourceStatus::Failed,
            Some("logs expired".into()),
            true,
            now,
        );
        assert_eq!(b.status, IngestionStatus::MissingResource);
    }

    #[test]
    fn transient_failure_yields_failed() {
        let mut b = build();
        let now = Utc::now();
        b.record_resource(
            ResourceName::GitHistory,
            ResourceStatus::Failed,
            Some("clone timed out".into()),
            false,
            now,
        );
        assert_eq!(b.status, IngestionStatus::Failed);
    }

    #[test]
    fn reingestion_resets_even_expected_loss_resources() {
        let mut b = build();
        let now = Utc::now();
        b.mark_missing_resource("logs expired", now);
        assert_eq!(b.status, IngestionStatus::MissingResource);
        b.reset_for_reingestion(now);
        assert_eq!(b.status, IngestionStatus::Pending);
        assert!(b
            .resource_status
            .values()
            .all(|e| e.status == ResourceStatus::Pending));
    }

    #[test]
    fn clone_level_failure_marks_every_required_resource() {
        let mut b = build();
        b.mark_missing_resource("repo clone failed", Utc::now());
        assert!(b
            .resource_status
            .values()
            .all(|e| e.status == ResourceStatus::Failed && e.expected_loss));
    }
}
