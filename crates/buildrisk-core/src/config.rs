//! Scenario YAML parsing (§6 External Interfaces). The wire shape is
//! nested to read naturally as a config file; it's flattened into the
//! domain's `DataSourceConfig`/`FeaturesConfig`/`SplittingConfig`/
//! `PreprocessingConfig`/`OutputConfig` on parse. Unknown top-level keys
//! are tolerated (`serde` ignores them by default on a non-`deny_unknown_fields`
//! struct) but the full raw text is kept on `Scenario::raw_yaml` regardless,
//! per the spec's "ignored but preserved" contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    DataSourceConfig, DomainError, FeaturesConfig, FilterMode, GroupBy, MissingValueStrategy,
    NormalizationMethod, OutputConfig, OutputFormat, PreprocessingConfig, Result, Scenario,
    SplitStrategy, SplittingConfig,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct RepositoriesYaml {
    #[serde(default)]
    filter_by: Option<String>,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    owners: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct DateRangeYaml {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct BuildsYaml {
    #[serde(default)]
    date_range: DateRangeYaml,
    #[serde(default)]
    conclusions: Vec<String>,
    #[serde(default)]
    exclude_bots: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct DataSourceYaml {
    #[serde(default)]
    repositories: RepositoriesYaml,
    #[serde(default)]
    builds: BuildsYaml,
    #[serde(default = "default_ci_provider")]
    ci_provider: String,
}

fn default_ci_provider() -> String {
    "all".to_string()
}

impl Default for DataSourceYaml {
    fn default() -> Self {
        Self {
            repositories: RepositoriesYaml::default(),
            builds: BuildsYaml::default(),
            ci_provider: default_ci_provider(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct ScanMetricsYaml {
    #[serde(default)]
    sonarqube: Vec<String>,
    #[serde(default)]
    trivy: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct FeaturesYaml {
    #[serde(default)]
    dag_features: Vec<String>,
    #[serde(default)]
    scan_metrics: ScanMetricsYaml,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    scan_config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SplittingConfigBodyYaml {
    #[serde(default = "default_ratios")]
    ratios: (f64, f64, f64),
    #[serde(default = "default_stratify_by")]
    stratify_by: String,
    #[serde(default)]
    test_groups: Vec<String>,
    #[serde(default)]
    val_groups: Vec<String>,
    #[serde(default)]
    train_groups: Vec<String>,
    #[serde(default = "default_reduce_label")]
    reduce_label: u8,
    #[serde(default = "default_reduce_ratio")]
    reduce_ratio: f64,
    #[serde(default)]
    novelty_group: Option<String>,
    #[serde(default = "default_reduce_label")]
    novelty_label: u8,
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

impl Default for SplittingConfigBodyYaml {
    fn default() -> Self {
        Self {
            ratios: default_ratios(),
            stratify_by: default_stratify_by(),
            test_groups: Vec::new(),
            val_groups: Vec::new(),
            train_groups: Vec::new(),
            reduce_label: default_reduce_label(),
            reduce_ratio: default_reduce_ratio(),
            novelty_group: None,
            novelty_label: default_reduce_label(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SplittingYaml {
    strategy: SplitStrategy,
    group_by: GroupBy,
    #[serde(default)]
    config: SplittingConfigBodyYaml,
    #[serde(default = "default_true")]
    temporal_ordering: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SplittingYaml {
    fn default() -> Self {
        Self {
            strategy: SplitStrategy::StratifiedWithinGroup,
            group_by: GroupBy::LanguageGroup,
            config: SplittingConfigBodyYaml::default(),
            temporal_ordering: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct MissingFeaturesYaml {
    #[serde(default = "default_missing_value_strategy")]
    strategy: MissingValueStrategy,
    #[serde(default)]
    fill_value: f64,
}

fn default_missing_value_strategy() -> MissingValueStrategy {
    MissingValueStrategy::DropRow
}

impl Default for MissingValueStrategy {
    fn default() -> Self {
        MissingValueStrategy::DropRow
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct NormalizationYaml {
    #[serde(default)]
    method: NormalizationMethod,
}

impl Default for NormalizationMethod {
    fn default() -> Self {
        NormalizationMethod::None
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct PreprocessingYaml {
    #[serde(default)]
    missing_features: MissingFeaturesYaml,
    #[serde(default)]
    normalization: NormalizationYaml,
    #[serde(default)]
    strict_mode: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct OutputYaml {
    #[serde(default = "default_output_format")]
    format: OutputFormat,
    #[serde(default)]
    include_metadata: bool,
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Csv
}

impl Default for OutputYaml {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            include_metadata: false,
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Csv
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ScenarioYaml {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    data_source: DataSourceYaml,
    #[serde(default)]
    features: FeaturesYaml,
    #[serde(default)]
    splitting: SplittingYaml,
    #[serde(default)]
    preprocessing: PreprocessingYaml,
    #[serde(default)]
    output: OutputYaml,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn filter_mode_of(repositories: &RepositoriesYaml) -> FilterMode {
    match repositories.filter_by.as_deref() {
        Some("language") => FilterMode::ByLanguage,
        Some("name") => FilterMode::ByName,
        Some("owner") => FilterMode::ByOwner,
        _ => FilterMode::All,
    }
}

/// Parse a scenario's raw YAML into its structured configuration sections.
/// `Scenario::new` already stores `raw_yaml` verbatim; this only populates
/// the fields the engine interprets.
pub fn parse(raw_yaml: &str) -> Result<ScenarioConfig> {
    let parsed: ScenarioYaml = serde_yaml::from_str(raw_yaml).map_err(DomainError::Yaml)?;

    let data_source = DataSourceConfig {
        filter_mode: filter_mode_of(&parsed.data_source.repositories),
        languages: parsed.data_source.repositories.languages,
        names: parsed.data_source.repositories.names,
        owners: parsed.data_source.repositories.owners,
        date_start: parsed.data_source.builds.date_range.start,
        date_end: parsed.data_source.builds.date_range.end,
        conclusions: parsed.data_source.builds.conclusions,
        exclude_bots: parsed.data_source.builds.exclude_bots,
        ci_provider: parsed.data_source.ci_provider,
    };

    let features = FeaturesConfig {
        dag_features: parsed.features.dag_features,
        sonarqube_metrics: parsed.features.scan_metrics.sonarqube,
        trivy_metrics: parsed.features.scan_metrics.trivy,
        exclude: parsed.features.exclude,
        scan_config: parsed.features.scan_config,
    };

    let splitting = SplittingConfig {
        strategy: parsed.splitting.strategy,
        group_by: parsed.splitting.group_by,
        ratios: parsed.splitting.config.ratios,
        stratify_by: parsed.splitting.config.stratify_by,
        test_groups: parsed.splitting.config.test_groups,
        val_groups: parsed.splitting.config.val_groups,
        train_groups: parsed.splitting.config.train_groups,
        reduce_label: parsed.splitting.config.reduce_label,
        reduce_ratio: parsed.splitting.config.reduce_ratio,
        novelty_group: parsed.splitting.config.novelty_group,
        novelty_label: parsed.splitting.config.novelty_label,
        temporal_ordering: parsed.splitting.temporal_ordering,
    };

    let preprocessing = PreprocessingConfig {
        missing_value_strategy: parsed.preprocessing.missing_features.strategy,
        fill_value: parsed.preprocessing.missing_features.fill_value,
        normalization: parsed.preprocessing.normalization.method,
        strict_mode: parsed.preprocessing.strict_mode,
    };

    let output = OutputConfig {
        format: parsed.output.format,
        include_metadata: parsed.output.include_metadata,
    };

    Ok(ScenarioConfig { data_source, features, splitting, preprocessing, output })
}

pub struct ScenarioConfig {
    pub data_source: DataSourceConfig,
    pub features: FeaturesConfig,
    pub splitting: SplittingConfig,
    pub preprocessing: PreprocessingConfig,
    pub output: OutputConfig,
}

/// Build a brand-new `Scenario` from a name and raw YAML, applying the
/// parsed config on top of `Scenario::new`'s defaults.
pub fn build_scenario(owner_id: Uuid, name: impl Into<String>, raw_yaml: impl Into<String>) -> Result<Scenario> {
    let raw_yaml = raw_yaml.into();
    let config = parse(&raw_yaml)?;
    let mut scenario = Scenario::new(owner_id, name, raw_yaml);
    scenario.data_source = config.data_source;
    scenario.features = config.features;
    scenario.splitting = config.splitting;
    scenario.preprocessing = config.preprocessing;
    scenario.output = config.output;
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "1.0"
data_source:
  repositories:
    filter_by: language
    languages: ["rust", "python"]
  builds:
    conclusions: ["success", "failure"]
    exclude_bots: true
  ci_provider: github_actions
features:
  dag_features: ["git_*", "tr_tests_passed"]
  scan_metrics:
    sonarqube: ["bugs", "vulnerabilities"]
    trivy: ["critical_count"]
splitting:
  strategy: leave_one_out
  group_by: language_group
  config:
    test_groups: ["go"]
preprocessing:
  missing_features:
    strategy: fill
    fill_value: -1.0
  normalization:
    method: zscore
output:
  format: csv
"#;

    #[test]
    fn parses_full_scenario_yaml() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.data_source.filter_mode, FilterMode::ByLanguage);
        assert_eq!(config.data_source.languages, vec!["rust", "python"]);
        assert!(config.data_source.exclude_bots);
        assert_eq!(config.data_source.ci_provider, "github_actions");
        assert_eq!(config.features.dag_features, vec!["git_*", "tr_tests_passed"]);
        assert!(config.features.scan_enabled());
        assert_eq!(config.splitting.strategy, SplitStrategy::LeaveOneOut);
        assert_eq!(config.splitting.test_groups, vec!["go"]);
        assert_eq!(config.preprocessing.missing_value_strategy, MissingValueStrategy::Fill);
        assert_eq!(config.preprocessing.fill_value, -1.0);
        assert_eq!(config.preprocessing.normalization, NormalizationMethod::Zscore);
        assert_eq!(config.output.format, OutputFormat::Csv);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let minimal = "splitting:\n  strategy: stratified_within_group\n  group_by: language_group\n";
        let config = parse(minimal).unwrap();
        assert_eq!(config.data_source.ci_provider, "all");
        assert_eq!(config.output.format, OutputFormat::Csv);
        assert_eq!(config.splitting.ratios, (0.70, 0.15, 0.15));
    }

    #[test]
    fn invalid_yaml_is_a_configuration_error() {
        let err = parse("not: [valid: yaml: :: -").unwrap_err();
        assert!(matches!(err, DomainError::Yaml(_)));
    }

    #[test]
    fn build_scenario_stores_raw_yaml_verbatim() {
        let owner = Uuid::new_v4();
        let scenario = build_scenario(owner, "nightly", SAMPLE).unwrap();
        assert_eq!(scenario.raw_yaml, SAMPLE);
        assert_eq!(scenario.splitting.strategy, SplitStrategy::LeaveOneOut);
    }
}
