//! buildrisk-state: SurrealDB persistence layer for the build-risk dataset platform.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable storage for scenario pipeline entities and the
//! observability ledger, independent of the domain crate (see
//! `storage_traits` for why).
//!
//! ## Key Components
//!
//! - [`SurrealStore`]: SurrealDB connection implementing both storage traits
//! - [`EntityStore`] / [`PipelineRunLedger`]: payload-agnostic storage traits
//! - [`fakes`]: in-memory fakes for testing callers without a database

pub mod error;
pub mod fakes;
pub mod migrations;
pub mod schema;
pub mod storage_traits;
pub mod store;

pub use error::{StateError, StorageError, StorageResult};
pub use storage_traits::{EntityStore, PipelineRunLedger, ScenarioScopedRecord, GLOBAL_SCOPE};
pub use store::SurrealStore;

/// Result type for low-level connection/schema operations.
pub type Result<T> = std::result::Result<T, StateError>;
