//! Grouping-dimension pre-pass. Computes `DatasetRow::group_value` for each
//! of the four supported `GroupBy` dimensions before any splitting strategy
//! runs, since every strategy partitions by group rather than by row.
//!
//! `PercentageOfBuildsBefore`/`NumberOfBuildsBefore` bin into quartiles
//! computed from a sorted vector (pandas' `qcut` over a dataframe column,
//! without a dataframe dependency) — duplicate edges collapse exactly as
//! `qcut(..., duplicates="drop")` does, by deduping the bin edges before
//! assigning labels.

use chrono::Timelike;

use crate::domain::GroupBy;

use super::normalize::quantile;
use super::DatasetRow;

/// Fixed lookup mirroring the upstream language-group buckets: `backend`
/// (python/java/go/rust/c/cpp/csharp), `fullstack` (javascript/typescript/
/// ruby/php), `scripting` (bash/shell/powershell/perl/lua), `other`
/// (everything else).
fn language_group(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "python" | "java" | "go" | "rust" | "c" | "c++" | "cpp" | "csharp" => "backend",
        "javascript" | "typescript" | "ruby" | "php" => "fullstack",
        "bash" | "shell" | "powershell" | "perl" | "lua" => "scripting",
        _ => "other",
    }
}

pub fn assign(rows: &mut [DatasetRow], group_by: GroupBy) {
    match group_by {
        GroupBy::LanguageGroup => {
            for row in rows.iter_mut() {
                let language = row.primary_language.clone().unwrap_or_else(|| "unknown".to_string());
                row.group_value = Some(language_group(&language).to_string());
            }
        }
        GroupBy::TimeOfDay => {
            for row in rows.iter_mut() {
                row.group_value = Some(
                    row.build_started_at
                        .map(|ts| time_of_day_bucket(ts.hour()))
                        .unwrap_or("unknown")
                        .to_string(),
                );
            }
        }
        GroupBy::PercentageOfBuildsBefore => {
            assign_quartiles(rows, "percentage_of_builds_before");
        }
        GroupBy::NumberOfBuildsBefore => {
            assign_quartiles(rows, "number_of_builds_before");
        }
    }
}

fn time_of_day_bucket(hour: u32) -> &'static str {
    match hour {
        0..=5 => "night",
        6..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}

/// Quartile-bin the named feature into `q1`..`q4`, deduping edges the way
/// `qcut(duplicates="drop")` does when many rows share the same value.
fn assign_quartiles(rows: &mut [DatasetRow], feature_name: &str) {
    let values: Vec<f64> = rows.iter().filter_map(|r| r.feature_f64(feature_name)).collect();
    if values.is_empty() {
        for row in rows.iter_mut() {
            row.group_value = Some("unknown".to_string());
        }
        return;
    }

    let mut edges = vec![
        quantile(&values, 0.25),
        quantile(&values, 0.5),
        quantile(&values, 0.75),
    ];
    edges.dedup_by(|a, b| (*a - *b).abs() < 1e-12);

    for row in rows.iter_mut() {
        let label = match row.feature_f64(feature_name) {
            Some(x) => {
                let bucket = edges.iter().filter(|&&edge| x > edge).count();
                format!("q{}", bucket + 1)
            }
            None => "unknown".to_string(),
        };
        row.group_value = Some(label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FeatureValue;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn row(language: &str, hour: u32) -> DatasetRow {
        DatasetRow {
            enrichment_build_id: Uuid::new_v4(),
            raw_repo_id: Uuid::new_v4(),
            primary_language: Some(language.to_string()),
            build_started_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()),
            outcome: Some(0),
            features: BTreeMap::new(),
            group_value: None,
        }
    }

    #[test]
    fn language_group_maps_known_languages_onto_the_four_buckets() {
        let mut rows = vec![
            row("Rust", 0),
            row("TypeScript", 0),
            row("bash", 0),
            row("unknown-lang", 0),
        ];
        assign(&mut rows, GroupBy::LanguageGroup);
        assert_eq!(rows[0].group_value.as_deref(), Some("backend"));
        assert_eq!(rows[1].group_value.as_deref(), Some("fullstack"));
        assert_eq!(rows[2].group_value.as_deref(), Some("scripting"));
        assert_eq!(rows[3].group_value.as_deref(), Some("other"));
    }

    #[test]
    fn time_of_day_buckets_by_hour() {
        let mut rows = vec![row("rust", 3), row("rust", 14), row("rust", 20)];
        assign(&mut rows, GroupBy::TimeOfDay);
        assert_eq!(rows[0].group_value.as_deref(), Some("night"));
        assert_eq!(rows[1].group_value.as_deref(), Some("afternoon"));
        assert_eq!(rows[2].group_value.as_deref(), Some("evening"));
    }

    #[test]
    fn quartile_binning_collapses_duplicate_edges() {
        let mut rows: Vec<DatasetRow> = (0..8)
            .map(|_| {
                let mut r = row("rust", 0);
                r.features.insert(
                    "percentage_of_builds_before".to_string(),
                    FeatureValue::Number(5.0),
                );
                r
            })
            .collect();
        assign(&mut rows, GroupBy::PercentageOfBuildsBefore);
        assert!(rows.iter().all(|r| r.group_value.as_deref() == Some("q1")));
    }
}
