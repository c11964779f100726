//! Pipeline lifecycle adapter: bridges domain `PipelineRun`/`FeatureAuditLog`
//! events to durable `PipelineRunLedger` persistence.
//!
//! The ledger trait is payload-agnostic (see `buildrisk_state::storage_traits`),
//! so this module owns the JSON conversion at the boundary — the same shape
//! as the teacher's `GraphRunRecorder` converting `domain::Event` to `RunEvent`.

use std::sync::Arc;

use buildrisk_state::{PipelineRunLedger, StorageError, StorageResult};

use crate::domain::{FeatureAuditLog, Phase, PipelineRun};

/// Adapter that records one scenario's pipeline run into a [`PipelineRunLedger`].
///
/// Usage:
/// 1. Call [`PipelineRunRecorder::start`] to persist the initial run row.
/// 2. Call [`PipelineRunRecorder::record_phase`] as each phase transitions.
/// 3. Call [`PipelineRunRecorder::record_audit_log`] per build extraction attempt.
/// 4. Call [`PipelineRunRecorder::finish`] to finalize.
pub struct PipelineRunRecorder {
    ledger: Arc<dyn PipelineRunLedger>,
    run: PipelineRun,
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl PipelineRunRecorder {
    pub async fn start(
        ledger: Arc<dyn PipelineRunLedger>,
        run: PipelineRun,
    ) -> StorageResult<Self> {
        ledger.create_run(run.correlation_id, to_json(&run)?).await?;
        crate::obs::emit_run_started(
            &run.correlation_id.to_string(),
            &run.scenario_id.to_string(),
        );
        Ok(Self { ledger, run })
    }

    /// Persist the current phase state after a transition made by the caller.
    pub async fn record_phase(&self, phase: Phase) -> StorageResult<()> {
        self.ledger
            .update_run(self.run.correlation_id, to_json(&self.run)?)
            .await?;
        let record = self
            .run
            .phases
            .iter()
            .find(|p| p.phase == phase)
            .expect("phase recorded must be one PipelineRun::new seeded");
        crate::obs::emit_phase_transitioned(
            &self.run.correlation_id.to_string(),
            &format!("{phase:?}"),
            &format!("{:?}", record.status),
            record.item_count,
        );
        Ok(())
    }

    pub async fn record_audit_log(&self, log: &FeatureAuditLog) -> StorageResult<()> {
        self.ledger
            .append_audit_log(self.run.correlation_id, to_json(log)?)
            .await
    }

    pub fn run_mut(&mut self) -> &mut PipelineRun {
        &mut self.run
    }

    pub fn correlation_id(&self) -> uuid::Uuid {
        self.run.correlation_id
    }

    /// Finalize the run as completed or failed, driven by `self.run`'s own
    /// phase statuses.
    pub async fn finish(mut self, at: chrono::DateTime<chrono::Utc>) -> StorageResult<()> {
        self.run.finish(at);
        let success = !self.run.is_failed();
        let duration_ms = (at - self.run.started_at).num_milliseconds().max(0) as u64;
        self.ledger
            .update_run(self.run.correlation_id, to_json(&self.run)?)
            .await?;
        crate::obs::emit_run_finished(&self.run.correlation_id.to_string(), duration_ms, success);
        Ok(())
    }
}

/// Fetch and deserialize a previously-recorded PipelineRun, e.g. for
/// `GetScenarioSplits`-style drill-down queries.
pub async fn load_run(
    ledger: &dyn PipelineRunLedger,
    correlation_id: uuid::Uuid,
) -> StorageResult<Option<PipelineRun>> {
    match ledger.get_run(correlation_id).await? {
        Some(value) => Ok(Some(from_json(value)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildrisk_state::fakes::InMemoryPipelineRunLedger;
    use uuid::Uuid;

    #[tokio::test]
    async fn start_persists_run_and_emits_start_event() {
        let ledger = Arc::new(InMemoryPipelineRunLedger::new());
        let run = PipelineRun::new(Uuid::new_v4(), "deadbeef");
        let correlation_id = run.correlation_id;

        let recorder = PipelineRunRecorder::start(ledger.clone(), run).await.unwrap();
        assert_eq!(recorder.correlation_id(), correlation_id);
        assert!(load_run(ledger.as_ref(), correlation_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finish_marks_run_completed_when_no_phase_failed() {
        let ledger = Arc::new(InMemoryPipelineRunLedger::new());
        let mut recorder = PipelineRunRecorder::start(
            ledger.clone(),
            PipelineRun::new(Uuid::new_v4(), "deadbeef"),
        )
        .await
        .unwrap();
        let correlation_id = recorder.correlation_id();
        recorder
            .run_mut()
            .complete_phase(Phase::Filter, 10, chrono::Utc::now());
        recorder.finish(chrono::Utc::now()).await.unwrap();

        let stored = load_run(ledger.as_ref(), correlation_id).await.unwrap().unwrap();
        assert!(stored.completed_at.is_some());
        assert!(!stored.is_failed());
    }
}
