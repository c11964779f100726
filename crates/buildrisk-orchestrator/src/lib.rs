//! Scenario orchestration, ingestion workers, and scan dispatch for the
//! build-risk dataset platform.
//!
//! This crate composes `buildrisk-core`'s Task Runtime, Graph Composer,
//! Resource DAG and Feature DAG Engine into the concrete workers and
//! entry points a CLI or daemon process needs: repo ingestion
//! ([`tasks`]), scan dispatch ([`scan`]), the four-phase scenario
//! pipeline ([`scenario_orchestrator`]), and the supporting plumbing
//! (typed storage in [`store`], CI-provider access in [`provider`],
//! per-repo locking in [`locks`], pub/sub updates in [`events`]).

pub mod events;
pub mod locks;
pub mod provider;
pub mod scan;
pub mod scenario_orchestrator;
pub mod store;
pub mod tasks;

pub use events::{BroadcastEventBus, EventBus, EventEnvelope, EventTopic};
pub use locks::{RepoGuard, RepoLockRegistry};
pub use provider::{CiProviderClient, FakeCiProviderClient, GithubActionsClient, ProviderError};
pub use scan::{
    dedupe_scan_units, FakeScannerClient, ScanBatchConfig, ScanBatchOutcome, ScanDispatcher,
    ScanError, ScannerClient, ScanUnit,
};
pub use scenario_orchestrator::{run_pointer_kind, RunPointer, ScenarioOrchestrator};
pub use store::Repo;
pub use tasks::{
    CloneRepoTask, CreateWorktreesBatchTask, DownloadBuildLogsTask, RepoIngestionBuildResult,
    RepoIngestionBuildSpec, RepoIngestionInput, RepoIngestionOutput, RepoIngestionTask,
    ResourceResult, ResourceResultStatus, CONSECUTIVE_EXPIRED_LOG_STOP,
};
