//! Domain-level error taxonomy for the build-risk dataset platform.
//!
//! Mirrors the error-handling design: configuration, not-found, conflict,
//! retryable, rate-limited, missing-resource and fatal errors are distinct
//! variants so callers can branch on kind rather than message text.

/// Domain errors raised by scenario, feature-DAG, and splitting logic.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("scenario not found: {0}")]
    ScenarioNotFound(uuid::Uuid),

    #[error("build not found: {0}")]
    BuildNotFound(uuid::Uuid),

    #[error("split not found: {scenario_id}/{split_type}")]
    SplitNotFound {
        scenario_id: uuid::Uuid,
        split_type: String,
    },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("git error: {0}")]
    GitError(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::Configuration("missing data_source".to_string());
        assert!(err.to_string().contains("configuration error"));

        let id = uuid::Uuid::new_v4();
        let err = DomainError::ScenarioNotFound(id);
        assert!(err.to_string().contains("scenario not found"));
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = DomainError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }

    #[test]
    fn test_storage_error() {
        let err = DomainError::Storage("connection failed".to_string());
        assert!(err.to_string().contains("storage error"));
    }
}
