//! `PipelineRun` and `FeatureAuditLog` — observability records for one
//! scenario generation run, linked by correlation id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Filter,
    Ingest,
    Process,
    Split,
}

/// One phase's sub-record within a PipelineRun.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub item_count: u64,
    pub error: Option<String>,
}

impl PhaseRecord {
    fn pending(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
            item_count: 0,
            error: None,
        }
    }

    fn start(&mut self, at: DateTime<Utc>) {
        self.status = PhaseStatus::Running;
        self.started_at = Some(at);
    }

    fn complete(&mut self, item_count: u64, at: DateTime<Utc>) {
        self.status = PhaseStatus::Completed;
        self.item_count = item_count;
        self.completed_at = Some(at);
    }

    fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = PhaseStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(at);
    }
}

/// Tracks one whole scenario run under a generated correlation id, with one
/// sub-record per pipeline phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub scenario_id: Uuid,
    /// SHA-256 over the scenario's parsed configuration at dispatch time, so
    /// a run can always be traced back to the exact config that produced it
    /// even if the scenario is later edited.
    pub config_digest: String,
    pub phases: Vec<PhaseRecord>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(scenario_id: Uuid, config_digest: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            scenario_id,
            config_digest: config_digest.into(),
            phases: vec![
                PhaseRecord::pending(Phase::Filter),
                PhaseRecord::pending(Phase::Ingest),
                PhaseRecord::pending(Phase::Process),
                PhaseRecord::pending(Phase::Split),
            ],
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        self.phases
            .iter_mut()
            .find(|p| p.phase == phase)
            .expect("PipelineRun::new seeds all four phases")
    }

    pub fn start_phase(&mut self, phase: Phase, at: DateTime<Utc>) {
        self.phase_mut(phase).start(at);
    }

    pub fn complete_phase(&mut self, phase: Phase, item_count: u64, at: DateTime<Utc>) {
        self.phase_mut(phase).complete(item_count, at);
    }

    pub fn fail_phase(&mut self, phase: Phase, error: impl Into<String>, at: DateTime<Utc>) {
        self.phase_mut(phase).fail(error, at);
        self.completed_at = Some(at);
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
    }

    pub fn is_failed(&self) -> bool {
        self.phases.iter().any(|p| p.status == PhaseStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Succeeded,
    Skipped,
    Failed,
}

/// One Feature DAG node's contribution to an extraction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_name: String,
    pub outcome: NodeOutcome,
    pub duration_ms: u64,
    pub resources_used: Vec<String>,
    pub resources_missing: Vec<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub skip_reason: Option<String>,
}

/// One per-build per-extraction-attempt audit record, linked to its
/// PipelineRun via `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureAuditLog {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub scenario_id: Uuid,
    pub raw_build_run_id: Uuid,
    pub config_digest: String,
    pub nodes: Vec<NodeExecutionRecord>,
    pub created_at: DateTime<Utc>,
}

impl FeatureAuditLog {
    pub fn new(
        correlation_id: Uuid,
        scenario_id: Uuid,
        raw_build_run_id: Uuid,
        config_digest: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            scenario_id,
            raw_build_run_id,
            config_digest: config_digest.into(),
            nodes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn record_node(&mut self, record: NodeExecutionRecord) {
        self.nodes.push(record);
    }

    /// Derives the overall extraction status from per-node outcomes: all
    /// succeeded -> completed; some succeeded and some skipped/failed ->
    /// partial; none succeeded -> failed.
    pub fn summarize(&self) -> super::enrichment_build::ExtractionStatus {
        use super::enrichment_build::ExtractionStatus;
        let succeeded = self
            .nodes
            .iter()
            .filter(|n| n.outcome == NodeOutcome::Succeeded)
            .count();
        if succeeded == 0 {
            return ExtractionStatus::Failed;
        }
        if succeeded == self.nodes.len() {
            ExtractionStatus::Completed
        } else {
            ExtractionStatus::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_seeds_four_pending_phases() {
        let run = PipelineRun::new(Uuid::new_v4(), "deadbeef");
        assert_eq!(run.phases.len(), 4);
        assert!(run.phases.iter().all(|p| p.status == PhaseStatus::Pending));
    }

    #[test]
    fn fail_phase_sets_error_and_completes_run() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "deadbeef");
        run.start_phase(Phase::Filter, Utc::now());
        run.fail_phase(Phase::Filter, "no matches", Utc::now());
        assert!(run.is_failed());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn complete_phase_records_item_count() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "deadbeef");
        run.start_phase(Phase::Ingest, Utc::now());
        run.complete_phase(Phase::Ingest, 42, Utc::now());
        let ingest = run.phases.iter().find(|p| p.phase == Phase::Ingest).unwrap();
        assert_eq!(ingest.item_count, 42);
        assert_eq!(ingest.status, PhaseStatus::Completed);
    }

    fn node(outcome: NodeOutcome) -> NodeExecutionRecord {
        NodeExecutionRecord {
            node_name: "git_commit_meta".to_string(),
            outcome,
            duration_ms: 5,
            resources_used: vec!["git_worktree".to_string()],
            resources_missing: vec![],
            error: None,
            warning: None,
            skip_reason: None,
        }
    }

    #[test]
    fn summarize_all_succeeded_is_completed() {
        let mut log = FeatureAuditLog::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "d");
        log.record_node(node(NodeOutcome::Succeeded));
        log.record_node(node(NodeOutcome::Succeeded));
        assert_eq!(log.summarize(), super::super::enrichment_build::ExtractionStatus::Completed);
    }

    #[test]
    fn summarize_mixed_outcomes_is_partial() {
        let mut log = FeatureAuditLog::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "d");
        log.record_node(node(NodeOutcome::Succeeded));
        log.record_node(node(NodeOutcome::Skipped));
        assert_eq!(log.summarize(), super::super::enrichment_build::ExtractionStatus::Partial);
    }

    #[test]
    fn summarize_none_succeeded_is_failed() {
        let mut log = FeatureAuditLog::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "d");
        log.record_node(node(NodeOutcome::Failed));
        log.record_node(node(NodeOutcome::Skipped));
        assert_eq!(log.summarize(), super::super::enrichment_build::ExtractionStatus::Failed);
    }
}
