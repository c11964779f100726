//! Typed repository wrapper over `buildrisk_state::EntityStore`.
//!
//! `EntityStore` carries an opaque JSON payload so one SurrealDB table backs
//! every entity kind; this module owns the JSON conversion at that boundary
//! and a `kind` tag so `list_by_scenario` can separate e.g. IngestionBuild
//! rows from EnrichmentBuild rows sharing the same scenario id — the same
//! boundary-conversion shape `buildrisk_core::recording::PipelineRunRecorder`
//! uses for PipelineRun/FeatureAuditLog.

use std::marker::PhantomData;
use std::sync::Arc;

use buildrisk_state::{EntityStore, ScenarioScopedRecord, StorageError, StorageResult};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub struct Repo<T> {
    store: Arc<dyn EntityStore>,
    kind: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Repo<T> {
    pub fn new(store: Arc<dyn EntityStore>, kind: &'static str) -> Self {
        Self { store, kind, _marker: PhantomData }
    }

    pub async fn upsert(&self, id: Uuid, scenario_id: Uuid, value: &T) -> StorageResult<()> {
        let payload = serde_json::json!({"kind": self.kind, "data": value});
        self.store
            .upsert(ScenarioScopedRecord { id, scenario_id, payload, updated_at: Utc::now() })
            .await
    }

    pub async fn get(&self, id: Uuid) -> StorageResult<Option<T>> {
        match self.store.get(id).await? {
            Some(record) if record.payload.get("kind").and_then(|k| k.as_str()) == Some(self.kind) => {
                Ok(Some(self.decode(record)?))
            }
            _ => Ok(None),
        }
    }

    pub async fn list_by_scenario(&self, scenario_id: Uuid) -> StorageResult<Vec<T>> {
        let rows = self.store.list_by_scenario(scenario_id).await?;
        rows.into_iter()
            .filter(|r| r.payload.get("kind").and_then(|k| k.as_str()) == Some(self.kind))
            .map(|r| self.decode(r))
            .collect()
    }

    pub async fn delete(&self, id: Uuid) -> StorageResult<()> {
        self.store.delete(id).await
    }

    pub async fn delete_by_scenario(&self, scenario_id: Uuid) -> StorageResult<()> {
        // `delete_by_scenario` is kind-agnostic at the storage layer; callers
        // share one scenario_id across several Repo<T>s scoped to the same
        // scenario (IngestionBuild, EnrichmentBuild, ...), so this is safe to
        // call once per kind during a cascade delete.
        let rows = self.store.list_by_scenario(scenario_id).await?;
        for row in rows {
            if row.payload.get("kind").and_then(|k| k.as_str()) == Some(self.kind) {
                self.store.delete(row.id).await?;
            }
        }
        Ok(())
    }

    fn decode(&self, record: ScenarioScopedRecord) -> StorageResult<T> {
        let data = record.payload.get("data").cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildrisk_state::fakes::InMemoryEntityStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
    }

    #[tokio::test]
    async fn round_trips_typed_value() {
        let repo: Repo<Widget> = Repo::new(Arc::new(InMemoryEntityStore::new()), "widget");
        let scenario_id = Uuid::new_v4();
        let id = Uuid::new_v4();
        repo.upsert(id, scenario_id, &Widget { name: "a".into() }).await.unwrap();
        let fetched = repo.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "a");
    }

    #[tokio::test]
    async fn list_by_scenario_excludes_other_kinds_sharing_the_table() {
        let store = Arc::new(InMemoryEntityStore::new());
        let widgets: Repo<Widget> = Repo::new(store.clone(), "widget");
        let gadgets: Repo<String> = Repo::new(store.clone(), "gadget");
        let scenario_id = Uuid::new_v4();
        widgets.upsert(Uuid::new_v4(), scenario_id, &Widget { name: "a".into() }).await.unwrap();
        gadgets.upsert(Uuid::new_v4(), scenario_id, &"g".to_string()).await.unwrap();

        assert_eq!(widgets.list_by_scenario(scenario_id).await.unwrap().len(), 1);
        assert_eq!(gadgets.list_by_scenario(scenario_id).await.unwrap().len(), 1);
    }
}
