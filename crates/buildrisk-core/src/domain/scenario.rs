//! `Scenario` — the training-pipeline configuration and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{DomainError, Result};

/// Closed set of scenario lifecycle states. Transitions follow the linear
/// order below, except `Failed` may be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Queued,
    Filtering,
    Ingesting,
    Ingested,
    Processing,
    Processed,
    Splitting,
    Completed,
    Failed,
}

impl ScenarioStatus {
    /// Linear index used to validate forward-only transitions. `Failed` is
    /// handled separately since it is reachable from any non-terminal state.
    fn rank(self) -> u8 {
        match self {
            ScenarioStatus::Queued => 0,
            ScenarioStatus::Filtering => 1,
            ScenarioStatus::Ingesting => 2,
            ScenarioStatus::Ingested => 3,
            ScenarioStatus::Processing => 4,
            ScenarioStatus::Processed => 5,
            ScenarioStatus::Splitting => 6,
            ScenarioStatus::Completed => 7,
            ScenarioStatus::Failed => 8,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScenarioStatus::Completed | ScenarioStatus::Failed)
    }

    /// In-flight statuses that must reject a second generation dispatch.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ScenarioStatus::Filtering
                | ScenarioStatus::Ingesting
                | ScenarioStatus::Processing
                | ScenarioStatus::Splitting
        )
    }

    /// Validate `self -> next` against the linear ordering, with `Failed`
    /// always permitted from a non-terminal state.
    pub fn validate_transition(self, next: ScenarioStatus) -> Result<()> {
        if next == ScenarioStatus::Failed {
            if self == ScenarioStatus::Completed {
                return Err(DomainError::Conflict(
                    "cannot fail a completed scenario".to_string(),
                ));
            }
            return Ok(());
        }
        if next.rank() < self.rank() {
            return Err(DomainError::Conflict(format!(
                "illegal scenario transition {self:?} -> {next:?}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    All,
    ByLanguage,
    ByName,
    ByOwner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    pub date_start: Option<DateTime<Utc>>,
    pub date_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conclusions: Vec<String>,
    #[serde(default)]
    pub exclude_bots: bool,
    /// `"all"` or a specific provider name (e.g. `"github_actions"`).
    #[serde(default = "default_ci_provider")]
    pub ci_provider: String,
}

fn default_ci_provider() -> String {
    "all".to_string()
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            filter_mode: FilterMode::All,
            languages: Vec::new(),
            names: Vec::new(),
            owners: Vec::new(),
            date_start: None,
            date_end: None,
            conclusions: Vec::new(),
            exclude_bots: false,
            ci_provider: default_ci_provider(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Desired feature names; wildcards `gh_*`, `git_*`, `tr_*` permitted.
    #[serde(default)]
    pub dag_features: Vec<String>,
    /// Selected Sonar metric keys.
    #[serde(default)]
    pub sonarqube_metrics: Vec<String>,
    /// Selected Trivy metric keys.
    #[serde(default)]
    pub trivy_metrics: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Per-repo scan tool configuration, keyed by raw_repo_id string.
    #[serde(default)]
    pub scan_config: serde_json::Value,
}

impl FeaturesConfig {
    pub fn scan_enabled(&self) -> bool {
        !self.sonarqube_metrics.is_empty() || !self.trivy_metrics.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    StratifiedWithinGroup,
    LeaveOneOut,
    LeaveTwoOut,
    ImbalancedTrain,
    ExtremeNovelty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    LanguageGroup,
    PercentageOfBuildsBefore,
    NumberOfBuildsBefore,
    TimeOfDay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplittingConfig {
    pub strategy: SplitStrategy,
    pub group_by: GroupBy,
    #[serde(default = "default_ratios")]
    pub ratios: (f64, f64, f64),
    #[serde(default = "default_stratify_by")]
    pub stratify_by: String,
    #[serde(default)]
    pub test_groups: Vec<String>,
    #[serde(default)]
    pub val_groups: Vec<String>,
    #[serde(default)]
    pub train_groups: Vec<String>,
    #[serde(default = "default_reduce_label")]
    pub reduce_label: u8,
    #[serde(default = "default_reduce_ratio")]
    pub reduce_ratio: f64,
    pub novelty_group: Option<String>,
    #[serde(default = "default_reduce_label")]
    pub novelty_label: u8,
    #[serde(default = "default_true")]
    pub temporal_ordering: bool,
}

fn default_ratios() -> (f64, f64, f64) {
    (0.70, 0.15, 0.15)
}
fn default_stratify_by() -> String {
    "outcome".to_string()
}
fn default_reduce_label() -> u8 {
    1
}
fn default_reduce_ratio() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}

impl Default for SplittingConfig {
    fn default() -> Self {
        Self {
            strategy: SplitStrategy::StratifiedWithinGroup,
            group_by: GroupBy::LanguageGroup,
            ratios: default_ratios(),
            stratify_by: default_stratify_by(),
            test_groups: Vec::new(),
            val_groups: Vec::new(),
            train_groups: Vec::new(),
            reduce_label: default_reduce_label(),
            reduce_ratio: default_reduce_ratio(),
            novelty_group: None,
            novelty_label: default_reduce_label(),
            temporal_ordering: default_true(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValueStrategy {
    DropRow,
    Fill,
    SkipFeature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMethod {
    None,
    Minmax,
    Zscore,
    Robust,
    Maxabs,
    Log,
    Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default = "default_missing_value_strategy")]
    pub missing_value_strategy: MissingValueStrategy,
    #[serde(default)]
    pub fill_value: f64,
    #[serde(default = "default_normalization")]
    pub normalization: NormalizationMethod,
    #[serde(default)]
    pub strict_mode: bool,
}

fn default_missing_value_strategy() -> MissingValueStrategy {
    MissingValueStrategy::DropRow
}
fn default_normalization() -> NormalizationMethod {
    NormalizationMethod::None
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            missing_value_strategy: default_missing_value_strategy(),
            fill_value: 0.0,
            normalization: default_normalization(),
            strict_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Parquet,
    Csv,
    Pickle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    #[serde(default)]
    pub include_metadata: bool,
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Csv
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            include_metadata: false,
        }
    }
}

/// A named, versioned training-dataset configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: Uuid,
    pub owner_id: Uuid,
    /// Unique per owner.
    pub name: String,
    pub status: ScenarioStatus,
    pub data_source: DataSourceConfig,
    pub features: FeaturesConfig,
    pub splitting: SplittingConfig,
    pub preprocessing: PreprocessingConfig,
    pub output: OutputConfig,
    /// The raw YAML, including keys the engine does not interpret.
    pub raw_yaml: String,
    pub error_message: Option<String>,
    pub builds_total: u64,
    pub builds_ingested: u64,
    pub builds_features_extracted: u64,
    pub scans_total: u64,
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub scan_extraction_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scenario {
    pub fn new(owner_id: Uuid, name: impl Into<String>, raw_yaml: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name: name.into(),
            status: ScenarioStatus::Queued,
            data_source: DataSourceConfig::default(),
            features: FeaturesConfig::default(),
            splitting: SplittingConfig::default(),
            preprocessing: PreprocessingConfig::default(),
            output: OutputConfig::default(),
            raw_yaml: raw_yaml.into(),
            error_message: None,
            builds_total: 0,
            builds_ingested: 0,
            builds_features_extracted: 0,
            scans_total: 0,
            scans_completed: 0,
            scans_failed: 0,
            scan_extraction_completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: ScenarioStatus, at: DateTime<Utc>) -> Result<()> {
        self.status.validate_transition(next)?;
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> Result<()> {
        self.transition(ScenarioStatus::Failed, at)?;
        self.error_message = Some(message.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_to_ingesting_is_legal() {
        let status = ScenarioStatus::Queued;
        assert!(status.validate_transition(ScenarioStatus::Ingesting).is_ok());
    }

    #[test]
    fn backward_transition_is_rejected() {
        let status = ScenarioStatus::Processing;
        assert!(status.validate_transition(ScenarioStatus::Ingesting).is_err());
    }

    #[test]
    fn failed_reachable_from_any_non_terminal_state() {
        for status in [
            ScenarioStatus::Queued,
            ScenarioStatus::Filtering,
            ScenarioStatus::Ingesting,
            ScenarioStatus::Processing,
            ScenarioStatus::Splitting,
        ] {
            assert!(status.validate_transition(ScenarioStatus::Failed).is_ok());
        }
    }

    #[test]
    fn completed_cannot_be_failed() {
        let status = ScenarioStatus::Completed;
        assert!(status.validate_transition(ScenarioStatus::Failed).is_err());
    }

    #[test]
    fn in_flight_statuses_reject_concurrent_dispatch() {
        assert!(ScenarioStatus::Ingesting.is_in_flight());
        assert!(ScenarioStatus::Splitting.is_in_flight());
        assert!(!ScenarioStatus::Queued.is_in_flight());
        assert!(!ScenarioStatus::Completed.is_in_flight());
    }

    #[test]
    fn scenario_fail_sets_error_message() {
        let mut scenario = Scenario::new(Uuid::new_v4(), "nightly", "version: \"1.0\"");
        scenario.fail("no matches", Utc::now()).unwrap();
        assert_eq!(scenario.status, ScenarioStatus::Failed);
        assert_eq!(scenario.error_message.as_deref(), Some("no matches"));
    }

    #[test]
    fn default_ratios_sum_to_one() {
        let (train, val, test) = default_ratios();
        assert!((train + val + test - 1.0).abs() < 1e-9);
    }
}
