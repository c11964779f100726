//! buildrisk-core
//!
//! Domain model, Task Runtime, Graph Composer, Resource DAG, Feature DAG
//! Engine, and the splitting/export pipeline for the build-risk feature
//! extraction and dataset-generation platform.

pub mod config;
pub mod domain;
pub mod feature_dag;
pub mod git;
pub mod graph;
pub mod obs;
pub mod recording;
pub mod resource_dag;
pub mod runtime;
pub mod splitting;

pub use config::{build_scenario, parse as parse_scenario_yaml, ScenarioConfig};
pub use domain::{DomainError, FeatureValue, Result, Scenario, ScenarioStatus};

pub use feature_dag::{execute as execute_feature_dag, resolve as resolve_feature_dag, summarize as summarize_feature_dag};

pub use git::{capture_head_sha, checkout_worktree, clone_bare, commit_reachable, is_git_repo};

pub use graph::{ingestion_chain, ingestion_chord, parallel_repo_fanout, parallel_scan_batches, feature_extraction_chain, AttemptEpoch};

pub use obs::{
    emit_node_executed, emit_phase_transitioned, emit_run_finalize_error, emit_run_finished,
    emit_run_started, emit_scan_dispatched, init_tracing, RunSpan,
};

pub use recording::{load_run, PipelineRunRecorder};

pub use resource_dag::{resolve as resolve_resource_dag, ResourceLevels};

pub use runtime::{FailureKind, Runtime, Task, TaskContext, TaskFailure, TaskHandle};

pub use splitting::{apply_preprocessing, split as split_dataset, DatasetRow, SplitResult};

/// buildrisk-core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
