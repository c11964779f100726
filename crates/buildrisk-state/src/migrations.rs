//! SurrealDB schema migrations and initialization.
//!
//! Sets up the tables backing `EntityStore` and `PipelineRunLedger`. Safe to
//! call multiple times (idempotent) — mirrors the teacher's `init_schema`.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::Result;

/// Initialize all build-risk tables in SurrealDB.
///
/// Called once on first connection. Safe to call multiple times.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("initializing build-risk SurrealDB schema");

    init_entities_table(db).await?;
    init_pipeline_runs_table(db).await?;
    init_audit_logs_table(db).await?;

    info!("build-risk schema initialization complete");
    Ok(())
}

/// Generic entity table backing `EntityStore`: ingestion builds, enrichment
/// builds, feature vectors, dataset splits, scan-tracking rows, and the raw
/// repository/build-run mirrors.
async fn init_entities_table(db: &Surreal<Any>) -> Result<()> {
    db.query(
        "
        DEFINE TABLE entities SCHEMAFULL;
        DEFINE FIELD id ON entities TYPE uuid;
        DEFINE FIELD scenario_id ON entities TYPE uuid;
        DEFINE FIELD payload ON entities FLEXIBLE TYPE object;
        DEFINE FIELD updated_at ON entities TYPE datetime;
        DEFINE INDEX entities_id_idx ON entities COLUMNS id UNIQUE;
        DEFINE INDEX entities_scenario_idx ON entities COLUMNS scenario_id;
        ",
    )
    .await
    .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// One row per scenario pipeline run, keyed by correlation id.
async fn init_pipeline_runs_table(db: &Surreal<Any>) -> Result<()> {
    db.query(
        "
        DEFINE TABLE pipeline_runs SCHEMAFULL;
        DEFINE FIELD correlation_id ON pipeline_runs TYPE uuid;
        DEFINE FIELD payload ON pipeline_runs FLEXIBLE TYPE object;
        DEFINE FIELD updated_at ON pipeline_runs TYPE datetime;
        DEFINE INDEX pipeline_runs_correlation_idx ON pipeline_runs COLUMNS correlation_id UNIQUE;
        ",
    )
    .await
    .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Per-build feature-extraction audit trail, many rows per correlation id.
async fn init_audit_logs_table(db: &Surreal<Any>) -> Result<()> {
    db.query(
        "
        DEFINE TABLE audit_logs SCHEMAFULL;
        DEFINE FIELD id ON audit_logs TYPE uuid;
        DEFINE FIELD correlation_id ON audit_logs TYPE uuid;
        DEFINE FIELD payload ON audit_logs FLEXIBLE TYPE object;
        DEFINE FIELD created_at ON audit_logs TYPE datetime;
        DEFINE INDEX audit_logs_id_idx ON audit_logs COLUMNS id UNIQUE;
        DEFINE INDEX audit_logs_correlation_idx ON audit_logs COLUMNS correlation_id;
        ",
    )
    .await
    .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use surrealdb::engine::any::connect;

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let db = connect("mem://").await.unwrap();
        db.use_ns("buildrisk").use_db("main").await.unwrap();
        init_schema(&db).await.unwrap();
        init_schema(&db).await.unwrap();
    }
}
