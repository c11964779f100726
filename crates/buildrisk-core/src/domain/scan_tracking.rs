//! `SonarScanPending` and `TrivyCommitScan` — durable tracking rows for the
//! Scan Dispatcher (§4.7), created in bulk per scenario and deleted with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTool {
    Sonarqube,
    Trivy,
}

/// Deterministic Sonar component key: `<scenario-prefix>_<repo_owner_repo>_<sha[:12]>`.
pub fn component_key(scenario_prefix: &str, repo_full_name: &str, commit_sha: &str) -> String {
    let owner_repo = repo_full_name.replace('/', "_");
    let short_sha = &commit_sha[..commit_sha.len().min(12)];
    format!("{scenario_prefix}_{owner_repo}_{short_sha}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SonarScanStatus {
    Scanning,
    AwaitingWebhook,
    Completed,
    Failed,
    Cancelled,
}

/// One in-flight webhook-driven Sonar scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SonarScanPending {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub raw_repo_id: Uuid,
    pub commit_sha: String,
    pub component_key: String,
    pub status: SonarScanStatus,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl SonarScanPending {
    pub fn new(
        scenario_id: Uuid,
        raw_repo_id: Uuid,
        commit_sha: impl Into<String>,
        component_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scenario_id,
            raw_repo_id,
            commit_sha: commit_sha.into(),
            component_key: component_key.into(),
            status: SonarScanStatus::Scanning,
            dispatched_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
        }
    }

    pub fn mark_awaiting_webhook(&mut self) {
        self.status = SonarScanStatus::AwaitingWebhook;
    }

    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = SonarScanStatus::Completed;
        self.completed_at = Some(at);
    }

    pub fn fail(&mut self, at: DateTime<Utc>) {
        self.status = SonarScanStatus::Failed;
        self.completed_at = Some(at);
    }

    /// `RetryCommitScan` resets status to `scanning` and bumps retry count.
    pub fn retry(&mut self, at: DateTime<Utc>) {
        self.status = SonarScanStatus::Scanning;
        self.completed_at = None;
        self.dispatched_at = at;
        self.retry_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrivyScanStatus {
    Scanning,
    Completed,
    Failed,
}

/// One Trivy scan unit. Trivy has no webhook phase: the task runs the
/// scanner synchronously and backfills on return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrivyCommitScan {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub raw_repo_id: Uuid,
    pub commit_sha: String,
    pub status: TrivyScanStatus,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Parsed metric snapshot retained for audit purposes.
    pub metrics_snapshot: serde_json::Value,
}

impl TrivyCommitScan {
    pub fn new(scenario_id: Uuid, raw_repo_id: Uuid, commit_sha: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scenario_id,
            raw_repo_id,
            commit_sha: commit_sha.into(),
            status: TrivyScanStatus::Scanning,
            dispatched_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
            metrics_snapshot: serde_json::Value::Null,
        }
    }

    pub fn complete(&mut self, metrics: serde_json::Value, at: DateTime<Utc>) {
        self.status = TrivyScanStatus::Completed;
        self.metrics_snapshot = metrics;
        self.completed_at = Some(at);
    }

    pub fn fail(&mut self, at: DateTime<Utc>) {
        self.status = TrivyScanStatus::Failed;
        self.completed_at = Some(at);
    }

    pub fn retry(&mut self, at: DateTime<Utc>) {
        self.status = TrivyScanStatus::Scanning;
        self.completed_at = None;
        self.metrics_snapshot = serde_json::Value::Null;
        self.dispatched_at = at;
        self.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_key_truncates_sha_to_twelve_chars_and_replaces_slash() {
        let key = component_key("scn1", "org/repo", "0123456789abcdef");
        assert_eq!(key, "scn1_org_repo_0123456789ab");
    }

    #[test]
    fn sonar_retry_resets_status_and_bumps_count() {
        let mut pending = SonarScanPending::new(Uuid::new_v4(), Uuid::new_v4(), "abc", "key1");
        pending.fail(Utc::now());
        pending.retry(Utc::now());
        assert_eq!(pending.status, SonarScanStatus::Scanning);
        assert_eq!(pending.retry_count, 1);
        assert!(pending.completed_at.is_none());
    }

    #[test]
    fn trivy_complete_stores_metrics_snapshot() {
        let mut scan = TrivyCommitScan::new(Uuid::new_v4(), Uuid::new_v4(), "abc");
        scan.complete(serde_json::json!({"critical": 2}), Utc::now());
        assert_eq!(scan.status, TrivyScanStatus::Completed);
        assert_eq!(scan.metrics_snapshot["critical"], 2);
    }

    #[test]
    fn trivy_retry_clears_previous_metrics_snapshot() {
        let mut scan = TrivyCommitScan::new(Uuid::new_v4(), Uuid::new_v4(), "abc");
        scan.complete(serde_json::json!({"critical": 2}), Utc::now());
        scan.retry(Utc::now());
        assert_eq!(scan.metrics_snapshot, serde_json::Value::Null);
        assert_eq!(scan.retry_count, 1);
    }
}
