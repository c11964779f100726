//! In-memory fakes for storage traits (testing only).
//!
//! Provides `InMemoryEntityStore` and `InMemoryPipelineRunLedger` that
//! satisfy the trait contracts without a SurrealDB connection.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::storage_traits::{EntityStore, PipelineRunLedger, ScenarioScopedRecord};

/// In-memory `EntityStore` backed by a `HashMap<id, record>`.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    rows: Mutex<HashMap<Uuid, ScenarioScopedRecord>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn upsert(&self, record: ScenarioScopedRecord) -> StorageResult<()> {
        self.rows.lock().unwrap().insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<ScenarioScopedRecord>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn list_by_scenario(&self, scenario_id: Uuid) -> StorageResult<Vec<ScenarioScopedRecord>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.scenario_id == scenario_id)
            .cloned()
            .collect())
    }

    async fn delete_by_scenario(&self, scenario_id: Uuid) -> StorageResult<()> {
        self.rows.lock().unwrap().retain(|_, r| r.scenario_id != scenario_id);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StorageResult<()> {
        self.rows.lock().unwrap().remove(&id);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunState {
    run: serde_json::Value,
    audit_logs: Vec<serde_json::Value>,
}

/// In-memory `PipelineRunLedger` backed by a `HashMap<correlation_id, RunState>`.
#[derive(Debug, Default)]
pub struct InMemoryPipelineRunLedger {
    runs: Mutex<HashMap<Uuid, RunState>>,
}

impl InMemoryPipelineRunLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineRunLedger for InMemoryPipelineRunLedger {
    async fn create_run(&self, correlation_id: Uuid, run: serde_json::Value) -> StorageResult<()> {
        // Resuming a correlation id updates the existing entry in place so
        // audit logs appended so far survive, matching `SurrealStore`'s
        // update-else-create semantics.
        let mut runs = self.runs.lock().unwrap();
        runs.entry(correlation_id).or_default().run = run;
        Ok(())
    }

    async fn update_run(&self, correlation_id: Uuid, run: serde_json::Value) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs.entry(correlation_id).or_default();
        state.run = run;
        Ok(())
    }

    async fn get_run(&self, correlation_id: Uuid) -> StorageResult<Option<serde_json::Value>> {
        Ok(self.runs.lock().unwrap().get(&correlation_id).map(|s| s.run.clone()))
    }

    async fn append_audit_log(
        &self,
        correlation_id: Uuid,
        log: serde_json::Value,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        runs.entry(correlation_id).or_default().audit_logs.push(log);
        Ok(())
    }

    async fn list_audit_logs(&self, correlation_id: Uuid) -> StorageResult<Vec<serde_json::Value>> {
        Ok(self
            .runs
            .lock()
            .unwrap()
            .get(&correlation_id)
            .map(|s| s.audit_logs.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn entity_store_round_trips_and_scopes_by_scenario() {
        let store = InMemoryEntityStore::new();
        let scenario_id = Uuid::new_v4();
        let record = ScenarioScopedRecord {
            id: Uuid::new_v4(),
            scenario_id,
            payload: json!({"status": "pending"}),
            updated_at: Utc::now(),
        };
        store.upsert(record.clone()).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap().unwrap().payload, record.payload);
        assert_eq!(store.list_by_scenario(scenario_id).await.unwrap().len(), 1);
        store.delete_by_scenario(scenario_id).await.unwrap();
        assert!(store.list_by_scenario(scenario_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pipeline_run_ledger_tracks_run_and_audit_logs() {
        let ledger = InMemoryPipelineRunLedger::new();
        let correlation_id = Uuid::new_v4();
        ledger.create_run(correlation_id, json!({"phase": "filter"})).await.unwrap();
        ledger.append_audit_log(correlation_id, json!({"node": "git_clone"})).await.unwrap();
        ledger.update_run(correlation_id, json!({"phase": "ingest"})).await.unwrap();

        let run = ledger.get_run(correlation_id).await.unwrap().unwrap();
        assert_eq!(run["phase"], "ingest");
        assert_eq!(ledger.list_audit_logs(correlation_id).await.unwrap().len(), 1);
    }
}
