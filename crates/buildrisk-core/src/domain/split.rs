//! `DatasetSplit` — one exported split file for a scenario.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::scenario::OutputFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitType {
    Train,
    Validation,
    Test,
}

/// A generated, on-disk export of one partition of a scenario's dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSplit {
    pub id: Uuid,
    pub scenario_id: Uuid,
    pub split_type: SplitType,
    pub record_count: u64,
    pub feature_count: u64,
    /// outcome label -> count.
    pub class_distribution: BTreeMap<u8, u64>,
    /// group value -> count.
    pub group_distribution: BTreeMap<String, u64>,
    /// Relative to the scenario's output directory.
    pub file_path: String,
    pub file_size_bytes: u64,
    pub format: OutputFormat,
    pub feature_names: Vec<String>,
    pub generation_duration_ms: u64,
    pub checksum_md5: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl DatasetSplit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scenario_id: Uuid,
        split_type: SplitType,
        file_path: impl Into<String>,
        format: OutputFormat,
        feature_names: Vec<String>,
        record_count: u64,
        class_distribution: BTreeMap<u8, u64>,
        group_distribution: BTreeMap<String, u64>,
        file_size_bytes: u64,
        generation_duration_ms: u64,
        checksum_md5: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scenario_id,
            split_type,
            record_count,
            feature_count: feature_names.len() as u64,
            class_distribution,
            group_distribution,
            file_path: file_path.into(),
            file_size_bytes,
            format,
            feature_names,
            generation_duration_ms,
            checksum_md5,
            generated_at: Utc::now(),
        }
    }

    /// `record_count == sum(class_distribution.values())`, one of the
    /// system's testable properties.
    pub fn class_distribution_is_consistent(&self) -> bool {
        self.class_distribution.values().sum::<u64>() == self.record_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(record_count: u64, counts: &[(u8, u64)]) -> DatasetSplit {
        DatasetSplit::new(
            Uuid::new_v4(),
            SplitType::Train,
            "train.csv",
            OutputFormat::Csv,
            vec!["git_lines_changed".to_string()],
            record_count,
            counts.iter().copied().collect(),
            BTreeMap::new(),
            1024,
            50,
            None,
        )
    }

    #[test]
    fn feature_count_derived_from_feature_names() {
        let split = split(10, &[(0, 6), (1, 4)]);
        assert_eq!(split.feature_count, 1);
    }

    #[test]
    fn class_distribution_consistent_when_sum_matches_record_count() {
        let split = split(10, &[(0, 6), (1, 4)]);
        assert!(split.class_distribution_is_consistent());
    }

    #[test]
    fn class_distribution_inconsistent_when_sum_diverges() {
        let split = split(10, &[(0, 6), (1, 1)]);
        assert!(!split.class_distribution_is_consistent());
    }
}
