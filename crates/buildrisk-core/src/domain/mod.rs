//! Domain model for the build-risk feature extraction and dataset-generation
//! platform.
//!
//! Canonical definitions for the entities described by the data model:
//! `RawRepository`, `RawBuildRun`, `Scenario` (and its configuration
//! sections), `IngestionBuild`, `EnrichmentBuild`, `FeatureVector`,
//! `DatasetSplit`, `PipelineRun`/`FeatureAuditLog`, and the scan-tracking
//! rows that back the Scan Dispatcher.

pub mod digest;
pub mod enrichment_build;
pub mod error;
pub mod feature_vector;
pub mod ingestion_build;
pub mod pipeline_run;
pub mod raw_build_run;
pub mod raw_repository;
pub mod scan_tracking;
pub mod scenario;
pub mod split;

pub use enrichment_build::{EnrichmentBuild, ExtractionStatus, SplitAssignment};
pub use error::{DomainError, Result};
pub use feature_vector::{FeatureScope, FeatureValue, FeatureVector};
pub use ingestion_build::{IngestionBuild, IngestionStatus, ResourceName, ResourceStatus};
pub use pipeline_run::{
    FeatureAuditLog, NodeExecutionRecord, NodeOutcome, Phase, PhaseRecord, PhaseStatus, PipelineRun,
};
pub use raw_build_run::{BuildConclusion, RawBuildRun};
pub use raw_repository::RawRepository;
pub use scan_tracking::{ScanTool, SonarScanPending, TrivyCommitScan};
pub use scenario::{
    DataSourceConfig, FeaturesConfig, FilterMode, GroupBy, MissingValueStrategy,
    NormalizationMethod, OutputConfig, OutputFormat, PreprocessingConfig, Scenario,
    ScenarioStatus, SplitStrategy, SplittingConfig,
};
pub use split::{DatasetSplit, SplitType};
