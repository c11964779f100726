//! SurrealDB-backed implementations of `EntityStore` and `PipelineRunLedger`.

use async_trait::async_trait;
use chrono::Utc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StateError, StorageError, StorageResult};
use crate::migrations;
use crate::schema::{AuditLogRow, EntityRow, PipelineRunRow};
use crate::storage_traits::{EntityStore, PipelineRunLedger, ScenarioScopedRecord};

/// Single SurrealDB connection implementing both `EntityStore` and
/// `PipelineRunLedger`. One instance backs one scenario-platform node.
pub struct SurrealStore {
    db: Surreal<Any>,
}

impl SurrealStore {
    /// Connect to an in-memory database for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect("mem://")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        db.use_ns("buildrisk")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Connect using `SURREALDB_URL`, falling back to local `surrealkv://` persistence.
    pub async fn from_env() -> crate::Result<Self> {
        let url = std::env::var("SURREALDB_URL").unwrap_or_else(|_| {
            let path = ".buildrisk/db";
            std::fs::create_dir_all(path).ok();
            format!("surrealkv://{path}")
        });

        let db = surrealdb::engine::any::connect(&url)
            .await
            .map_err(|e| StateError::Connection(format!("failed to connect to {url}: {e}")))?;

        db.use_ns("buildrisk")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(%url, "SurrealStore connected");
        Ok(Self { db })
    }
}

#[async_trait]
impl EntityStore for SurrealStore {
    async fn upsert(&self, record: ScenarioScopedRecord) -> StorageResult<()> {
        let row = EntityRow {
            id: record.id,
            scenario_id: record.scenario_id,
            payload: record.payload,
            updated_at: record.updated_at,
        };
        debug!(id = %row.id, "upserting entity row");

        let mut res = self
            .db
            .query("UPDATE entities CONTENT $row WHERE id = $id")
            .bind(("row", row.clone()))
            .bind(("id", row.id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let updated: Vec<EntityRow> =
            res.take(0).map_err(|e| StorageError::Backend(e.to_string()))?;

        if updated.is_empty() {
            let _created: Option<EntityRow> = self
                .db
                .create("entities")
                .content(row)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<ScenarioScopedRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM entities WHERE id = $id")
            .bind(("id", id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<EntityRow> =
            res.take(0).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next().map(row_to_record))
    }

    async fn list_by_scenario(&self, scenario_id: Uuid) -> StorageResult<Vec<ScenarioScopedRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM entities WHERE scenario_id = $scenario_id")
            .bind(("scenario_id", scenario_id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<EntityRow> =
            res.take(0).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    async fn delete_by_scenario(&self, scenario_id: Uuid) -> StorageResult<()> {
        self.db
            .query("DELETE entities WHERE scenario_id = $scenario_id")
            .bind(("scenario_id", scenario_id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StorageResult<()> {
        self.db
            .query("DELETE entities WHERE id = $id")
            .bind(("id", id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

fn row_to_record(row: EntityRow) -> ScenarioScopedRecord {
    ScenarioScopedRecord {
        id: row.id,
        scenario_id: row.scenario_id,
        payload: row.payload,
        updated_at: row.updated_at,
    }
}

#[async_trait]
impl PipelineRunLedger for SurrealStore {
    async fn create_run(&self, correlation_id: Uuid, run: serde_json::Value) -> StorageResult<()> {
        let row = PipelineRunRow {
            correlation_id,
            payload: run,
            updated_at: Utc::now(),
        };
        debug!(%correlation_id, "upserting pipeline run row");

        // Resuming a correlation id (e.g. re-entering processing after
        // filtering/ingestion already persisted this run) must update the
        // existing row rather than create a sibling one.
        let mut res = self
            .db
            .query("UPDATE pipeline_runs CONTENT $row WHERE correlation_id = $cid")
            .bind(("row", row.clone()))
            .bind(("cid", correlation_id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let updated: Vec<PipelineRunRow> =
            res.take(0).map_err(|e| StorageError::Backend(e.to_string()))?;

        if updated.is_empty() {
            let _created: Option<PipelineRunRow> = self
                .db
                .create("pipeline_runs")
                .content(row)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn update_run(&self, correlation_id: Uuid, run: serde_json::Value) -> StorageResult<()> {
        let row = PipelineRunRow {
            correlation_id,
            payload: run,
            updated_at: Utc::now(),
        };
        let mut res = self
            .db
            .query("UPDATE pipeline_runs CONTENT $row WHERE correlation_id = $cid")
            .bind(("row", row))
            .bind(("cid", correlation_id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let updated: Vec<PipelineRunRow> =
            res.take(0).map_err(|e| StorageError::Backend(e.to_string()))?;
        if updated.is_empty() {
            return Err(StorageError::PipelineRunNotFound(correlation_id));
        }
        Ok(())
    }

    async fn get_run(&self, correlation_id: Uuid) -> StorageResult<Option<serde_json::Value>> {
        let mut res = self
            .db
            .query("SELECT * FROM pipeline_runs WHERE correlation_id = $cid")
            .bind(("cid", correlation_id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<PipelineRunRow> =
            res.take(0).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next().map(|r| r.payload))
    }

    async fn append_audit_log(
        &self,
        correlation_id: Uuid,
        log: serde_json::Value,
    ) -> StorageResult<()> {
        let row = AuditLogRow {
            id: Uuid::new_v4(),
            correlation_id,
            payload: log,
            created_at: Utc::now(),
        };
        let _created: Option<AuditLogRow> = self
            .db
            .create("audit_logs")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn list_audit_logs(&self, correlation_id: Uuid) -> StorageResult<Vec<serde_json::Value>> {
        let mut res = self
            .db
            .query("SELECT * FROM audit_logs WHERE correlation_id = $cid")
            .bind(("cid", correlation_id))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<AuditLogRow> =
            res.take(0).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(|r| r.payload).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn entity_store_round_trips_through_surrealdb() {
        let store = SurrealStore::in_memory().await.unwrap();
        let scenario_id = Uuid::new_v4();
        let record = ScenarioScopedRecord {
            id: Uuid::new_v4(),
            scenario_id,
            payload: json!({"status": "pending"}),
            updated_at: Utc::now(),
        };
        store.upsert(record.clone()).await.unwrap();

        let fetched = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(fetched.payload, record.payload);
        assert_eq!(store.list_by_scenario(scenario_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pipeline_run_ledger_round_trips_through_surrealdb() {
        let store = SurrealStore::in_memory().await.unwrap();
        let correlation_id = Uuid::new_v4();
        store
            .create_run(correlation_id, json!({"phase": "filter"}))
            .await
            .unwrap();
        store
            .append_audit_log(correlation_id, json!({"node": "git_clone"}))
            .await
            .unwrap();

        let run = store.get_run(correlation_id).await.unwrap().unwrap();
        assert_eq!(run["phase"], "filter");
        assert_eq!(store.list_audit_logs(correlation_id).await.unwrap().len(), 1);
    }
}
