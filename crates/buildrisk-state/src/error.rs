//! Error types for the persistence layer.

use thiserror::Error;

/// Errors from the low-level SurrealDB connection/schema layer.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("database query failed: {0}")]
    Query(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("schema setup failed: {0}")]
    SchemaSetup(String),

    #[error("transaction failed: {0}")]
    Transaction(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the typed store traits (`ScenarioStore`,
/// `PipelineRunLedger`, etc).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("scenario not found: {0}")]
    ScenarioNotFound(uuid::Uuid),

    #[error("raw repository not found: {0}")]
    RawRepositoryNotFound(uuid::Uuid),

    #[error("raw build run not found: {0}")]
    RawBuildRunNotFound(uuid::Uuid),

    #[error("ingestion build not found: {0}")]
    IngestionBuildNotFound(uuid::Uuid),

    #[error("enrichment build not found: {0}")]
    EnrichmentBuildNotFound(uuid::Uuid),

    #[error("feature vector not found: {0}")]
    FeatureVectorNotFound(uuid::Uuid),

    #[error("pipeline run not found: {0}")]
    PipelineRunNotFound(uuid::Uuid),

    #[error("dataset split not found: {0}")]
    DatasetSplitNotFound(uuid::Uuid),

    #[error("scan tracking row not found: {0}")]
    ScanRowNotFound(uuid::Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
