//! Storage trait definitions for the build-risk dataset platform.
//!
//! Mirrors the teacher's `RunLedger`/`CasStore` split: this crate owns
//! ledger-native record shapes and knows nothing about the domain crate's
//! types. Callers (buildrisk-core's `recording` module, the orchestrator
//! crate) convert their domain structs to/from these at the boundary, the
//! same way `GraphRunRecorder` converted `domain::Event` to `RunEvent`.
//!
//! Rows are addressed by the caller's own UUIDs (correlation id, scenario
//! id, entity id) and carry an opaque `serde_json::Value` payload plus the
//! handful of fields every store needs to index or filter on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageResult;

/// Placeholder `scenario_id` for entity rows that are not owned by any one
/// scenario (`RawRepository`, `RawBuildRun` are shared across scenarios by
/// identity). Callers needing these by id rather than by scenario pass this.
pub const GLOBAL_SCOPE: Uuid = Uuid::nil();

/// One row in an entity store: an opaque payload plus the scenario it
/// belongs to, for cascade-delete and scenario-scoped listing.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScenarioScopedRecord {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Generic store for one entity table, scoped by scenario for bulk
/// create/list/cascade-delete. Used for RawRepository/RawBuildRun (scenario
/// id is the owning repo's nil-scope placeholder — see `store::GLOBAL_SCOPE`),
/// IngestionBuild, EnrichmentBuild, FeatureVector, DatasetSplit, and the two
/// scan-tracking tables.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert(&self, record: ScenarioScopedRecord) -> StorageResult<()>;
    async fn get(&self, id: Uuid) -> StorageResult<Option<ScenarioScopedRecord>>;
    async fn list_by_scenario(&self, scenario_id: Uuid) -> StorageResult<Vec<ScenarioScopedRecord>>;
    async fn delete_by_scenario(&self, scenario_id: Uuid) -> StorageResult<()>;
    async fn delete(&self, id: Uuid) -> StorageResult<()>;
}

/// Observability ledger for PipelineRun/FeatureAuditLog records, keyed by
/// correlation id.
#[async_trait]
pub trait PipelineRunLedger: Send + Sync {
    async fn create_run(&self, correlation_id: Uuid, run: serde_json::Value) -> StorageResult<()>;
    async fn update_run(&self, correlation_id: Uuid, run: serde_json::Value) -> StorageResult<()>;
    async fn get_run(&self, correlation_id: Uuid) -> StorageResult<Option<serde_json::Value>>;
    async fn append_audit_log(
        &self,
        correlation_id: Uuid,
        log: serde_json::Value,
    ) -> StorageResult<()>;
    async fn list_audit_logs(&self, correlation_id: Uuid) -> StorageResult<Vec<serde_json::Value>>;
}
