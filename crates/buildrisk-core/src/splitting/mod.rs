//! Splitter & Exporter (C8): preprocessing, grouping, the five splitting
//! strategies, and dataset export.
//!
//! Grounded in `original_source/backend/app/services/splitting_strategy_service.py`
//! and `normalization_service.py` for exact numeric semantics — the
//! distilled spec only summarises these (see SPEC_FULL.md §4.8).

pub mod export;
pub mod grouping;
pub mod normalize;
pub mod strategies;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{FeatureValue, MissingValueStrategy, PreprocessingConfig, SplitAssignment, SplittingConfig};

/// One row of the assembled frame, ready for preprocessing/grouping/split.
#[derive(Debug, Clone)]
pub struct DatasetRow {
    pub enrichment_build_id: Uuid,
    pub raw_repo_id: Uuid,
    pub primary_language: Option<String>,
    pub build_started_at: Option<DateTime<Utc>>,
    pub outcome: Option<u8>,
    pub features: BTreeMap<String, FeatureValue>,
    /// Materialised by `grouping::assign` before splitting.
    pub group_value: Option<String>,
}

impl DatasetRow {
    pub fn feature_f64(&self, name: &str) -> Option<f64> {
        self.features.get(name).and_then(|v| v.as_f64())
    }
}

/// Apply the missing-value strategy, then normalize, over `feature_names`.
/// Returns the (possibly reduced) feature name list — `skip_feature` removes
/// columns entirely.
pub fn apply_preprocessing(
    rows: &mut Vec<DatasetRow>,
    config: &PreprocessingConfig,
    feature_names: &[String],
) -> Vec<String> {
    let mut kept: Vec<String> = feature_names.to_vec();

    match config.missing_value_strategy {
        MissingValueStrategy::DropRow => {
            rows.retain(|r| kept.iter().all(|f| r.features.get(f).map(|v| !v.is_null()).unwrap_or(false)));
        }
        MissingValueStrategy::Fill => {
            let fill = config.fill_value;
            for row in rows.iter_mut() {
                for f in &kept {
                    let needs_fill = row.features.get(f).map(|v| v.is_null()).unwrap_or(true);
                    if needs_fill {
                        row.features.insert(f.clone(), FeatureValue::Number(fill));
                    }
                }
            }
        }
        MissingValueStrategy::SkipFeature => {
            kept.retain(|f| rows.iter().all(|r| r.features.get(f).map(|v| !v.is_null()).unwrap_or(false)));
        }
    }

    normalize::apply(rows, &kept, config.normalization);
    kept
}

/// Run the grouping pre-pass, the temporal pre-pass (when configured), and
/// the configured splitting strategy, in that order — the ordering spelled
/// out in SPEC_FULL.md §4.8: preprocessing happens first (the caller should
/// already have called `apply_preprocessing`), then grouping, then
/// temporal sort, then the strategy itself.
pub fn split(mut rows: Vec<DatasetRow>, config: &SplittingConfig) -> SplitResult {
    grouping::assign(&mut rows, config.group_by);
    if config.temporal_ordering {
        rows.sort_by_key(|r| r.build_started_at);
    }
    strategies::split(rows, config)
}

/// Split assignment plus the DatasetSplit summary rows the caller should
/// persist.
pub struct SplitResult {
    pub train: Vec<DatasetRow>,
    pub validation: Vec<DatasetRow>,
    pub test: Vec<DatasetRow>,
}

impl SplitResult {
    pub fn partition(&self, assignment: SplitAssignment) -> &[DatasetRow] {
        match assignment {
            SplitAssignment::Train => &self.train,
            SplitAssignment::Validation => &self.validation,
            SplitAssignment::Test => &self.test,
        }
    }

    pub fn class_distribution(rows: &[DatasetRow]) -> BTreeMap<u8, u64> {
        let mut dist = BTreeMap::new();
        for row in rows {
            if let Some(outcome) = row.outcome {
                *dist.entry(outcome).or_insert(0u64) += 1;
            }
        }
        dist
    }

    pub fn group_distribution(rows: &[DatasetRow]) -> BTreeMap<String, u64> {
        let mut dist = BTreeMap::new();
        for row in rows {
            if let Some(group) = &row.group_value {
                *dist.entry(group.clone()).or_insert(0u64) += 1;
            }
        }
        dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NormalizationMethod;

    fn row(outcome: Option<u8>, feature: Option<f64>) -> DatasetRow {
        DatasetRow {
            enrichment_build_id: Uuid::new_v4(),
            raw_repo_id: Uuid::new_v4(),
            primary_language: Some("python".to_string()),
            build_started_at: None,
            outcome,
            features: feature
                .map(|v| {
                    let mut m = BTreeMap::new();
                    m.insert("git_commit_count".to_string(), FeatureValue::Number(v));
                    m
                })
                .unwrap_or_default(),
            group_value: None,
        }
    }

    #[test]
    fn drop_row_removes_rows_missing_any_required_feature() {
        let mut rows = vec![row(Some(0), Some(1.0)), row(Some(1), None)];
        let config = PreprocessingConfig {
            missing_value_strategy: MissingValueStrategy::DropRow,
            fill_value: 0.0,
            normalization: NormalizationMethod::None,
            strict_mode: false,
        };
        apply_preprocessing(&mut rows, &config, &["git_commit_count".to_string()]);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn fill_strategy_substitutes_missing_values() {
        let mut rows = vec![row(Some(0), None)];
        let config = PreprocessingConfig {
            missing_value_strategy: MissingValueStrategy::Fill,
            fill_value: -1.0,
            normalization: NormalizationMethod::None,
            strict_mode: false,
        };
        apply_preprocessing(&mut rows, &config, &["git_commit_count".to_string()]);
        assert_eq!(rows[0].feature_f64("git_commit_count"), Some(-1.0));
    }

    #[test]
    fn skip_feature_drops_the_column_name_from_the_kept_list() {
        let mut rows = vec![row(Some(0), Some(1.0)), row(Some(1), None)];
        let config = PreprocessingConfig {
            missing_value_strategy: MissingValueStrategy::SkipFeature,
            fill_value: 0.0,
            normalization: NormalizationMethod::None,
            strict_mode: false,
        };
        let kept = apply_preprocessing(&mut rows, &config, &["git_commit_count".to_string()]);
        assert!(kept.is_empty());
        assert_eq!(rows.len(), 2);
    }
}
