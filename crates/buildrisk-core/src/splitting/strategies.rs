//! The five splitting strategies, resolved against
//! `original_source/backend/app/services/splitting_strategy_service.py`.
//!
//! All strategies operate on rows that already carry `group_value`
//! (`grouping::assign`) and, when `temporal_ordering` is set, are already
//! sorted by `build_started_at`. Group assignment across strategies is
//! deterministic — rows are never shuffled by wall-clock randomness, only
//! `imbalanced_train`'s reduction step draws from a seeded RNG.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::domain::SplittingConfig;

use super::{DatasetRow, SplitResult};

/// Groups with fewer than this many rows are kept entirely in `train` —
/// there isn't enough signal in the group to support a meaningful
/// validation/test slice.
const MIN_GROUP_SIZE_FOR_SPLIT: usize = 3;

pub fn split(rows: Vec<DatasetRow>, config: &SplittingConfig) -> SplitResult {
    use crate::domain::SplitStrategy::*;
    match config.strategy {
        StratifiedWithinGroup => stratified_within_group(rows, config.ratios),
        LeaveOneOut => leave_groups_out(rows, config, false),
        LeaveTwoOut => leave_groups_out(rows, config, true),
        ImbalancedTrain => imbalanced_train(rows, config),
        ExtremeNovelty => extreme_novelty(rows, config),
    }
}

/// Two-stage stratified split: split off `test` by its ratio, then split
/// the remainder into `train`/`val` by the renormalized train:val ratio.
/// Stratification is by outcome label, applied independently within each
/// `group_value` bucket so class proportions hold inside every group.
fn stratified_within_group(rows: Vec<DatasetRow>, ratios: (f64, f64, f64)) -> SplitResult {
    let mut groups: BTreeMap<String, Vec<DatasetRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.group_value.clone().unwrap_or_default()).or_default().push(row);
    }

    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut test = Vec::new();

    for (_, group_rows) in groups {
        if group_rows.len() < MIN_GROUP_SIZE_FOR_SPLIT {
            train.extend(group_rows);
            continue;
        }
        let (t, v, te) = stratified_partition(group_rows, ratios);
        train.extend(t);
        validation.extend(v);
        test.extend(te);
    }

    SplitResult { train, validation, test }
}

/// Stratify `rows` by outcome label and slice each class bucket by `ratios`.
/// Buckets are ordered by `enrichment_build_id` before slicing so the split
/// is deterministic across runs given the same input set.
fn stratified_partition(rows: Vec<DatasetRow>, ratios: (f64, f64, f64)) -> (Vec<DatasetRow>, Vec<DatasetRow>, Vec<DatasetRow>) {
    let mut by_outcome: BTreeMap<Option<u8>, Vec<DatasetRow>> = BTreeMap::new();
    for row in rows {
        by_outcome.entry(row.outcome).or_default().push(row);
    }

    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut test = Vec::new();

    for (_, mut bucket) in by_outcome {
        bucket.sort_by_key(|r| r.enrichment_build_id);
        let n = bucket.len();
        let n_test = ((n as f64) * ratios.2).round() as usize;
        let n_val = ((n as f64) * ratios.1).round() as usize;
        let n_val = n_val.min(n.saturating_sub(n_test));
        let n_train = n.saturating_sub(n_test + n_val);

        let mut iter = bucket.into_iter();
        train.extend(iter.by_ref().take(n_train));
        validation.extend(iter.by_ref().take(n_val));
        test.extend(iter);
    }

    (train, validation, test)
}

/// `leave_one_out` / `leave_two_out`: hold out whole groups for test (and,
/// in the two-out case, validation) rather than drawing a per-row sample.
/// Held-out groups come from `config.test_groups`/`config.val_groups` when
/// given; otherwise the lexicographically-last group(s) are auto-assigned,
/// deterministically, so repeated runs pick the same groups.
///
/// If there are not enough distinct groups to hold any out, this falls
/// back to `stratified_within_group` and logs a warning rather than
/// failing the scenario — an under-provisioned scenario still produces a
/// usable (if less rigorous) dataset.
fn leave_groups_out(rows: Vec<DatasetRow>, config: &SplittingConfig, two_out: bool) -> SplitResult {
    let mut all_groups: Vec<String> = rows
        .iter()
        .filter_map(|r| r.group_value.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    all_groups.sort();

    let needed = if two_out { 2 } else { 1 };
    if all_groups.len() <= needed {
        tracing::warn!(
            available_groups = all_groups.len(),
            needed,
            "not enough distinct groups to hold out; falling back to stratified_within_group"
        );
        return stratified_within_group(rows, config.ratios);
    }

    let test_groups: Vec<String> = if !config.test_groups.is_empty() {
        config.test_groups.clone()
    } else {
        vec![all_groups.last().unwrap().clone()]
    };
    let val_groups: Vec<String> = if two_out {
        if !config.val_groups.is_empty() {
            config.val_groups.clone()
        } else {
            let candidate = all_groups.iter().rev().find(|g| !test_groups.contains(g)).cloned();
            candidate.into_iter().collect()
        }
    } else {
        Vec::new()
    };

    let mut train_val_rows = Vec::new();
    let mut test = Vec::new();
    let mut validation = Vec::new();

    for row in rows {
        let group = row.group_value.clone().unwrap_or_default();
        if test_groups.contains(&group) {
            test.push(row);
        } else if two_out && val_groups.contains(&group) {
            validation.push(row);
        } else {
            train_val_rows.push(row);
        }
    }

    if two_out {
        // Remaining groups are entirely train: no per-row ratio split needed,
        // the held-out groups already stand in for val/test.
        SplitResult { train: train_val_rows, validation, test }
    } else {
        // Single-group-out still needs train/val drawn from the rest.
        let (train_ratio, val_ratio, _) = config.ratios;
        let renorm = train_ratio + val_ratio;
        let ratios = if renorm > 0.0 {
            (train_ratio / renorm, val_ratio / renorm, 0.0)
        } else {
            (1.0, 0.0, 0.0)
        };
        let (train, val, _) = stratified_partition(train_val_rows, ratios);
        SplitResult { train, validation: val, test }
    }
}

/// Deliberately imbalance the training partition: after an ordinary
/// stratified split, draw down `reduce_label`'s representation in `train`
/// by `reduce_ratio`, seeded so the reduction is reproducible run-to-run.
fn imbalanced_train(rows: Vec<DatasetRow>, config: &SplittingConfig) -> SplitResult {
    let mut result = stratified_within_group(rows, config.ratios);

    let mut matching: Vec<usize> = result
        .train
        .iter()
        .enumerate()
        .filter(|(_, r)| r.outcome == Some(config.reduce_label))
        .map(|(i, _)| i)
        .collect();

    let mut rng = StdRng::seed_from_u64(42);
    matching.shuffle(&mut rng);

    let drop_count = ((matching.len() as f64) * config.reduce_ratio).round() as usize;
    let to_drop: std::collections::HashSet<usize> = matching.into_iter().take(drop_count).collect();

    let mut kept = Vec::with_capacity(result.train.len() - to_drop.len());
    for (i, row) in result.train.into_iter().enumerate() {
        if !to_drop.contains(&i) {
            kept.push(row);
        }
    }
    result.train = kept;
    result
}

/// Holds an entire, deliberately unusual group out for test — simulating a
/// "never seen before" scenario (e.g. a language or time bucket the model
/// never trained against) — optionally narrowed to rows matching
/// `novelty_label`. With no `novelty_group` configured this degrades to an
/// ordinary stratified split.
fn extreme_novelty(rows: Vec<DatasetRow>, config: &SplittingConfig) -> SplitResult {
    let Some(novelty_group) = &config.novelty_group else {
        return stratified_within_group(rows, config.ratios);
    };

    let mut test = Vec::new();
    let mut remainder = Vec::new();
    for row in rows {
        let in_novelty_group = row.group_value.as_deref() == Some(novelty_group.as_str());
        let matches_label = row.outcome == Some(config.novelty_label);
        if in_novelty_group && matches_label {
            test.push(row);
        } else {
            remainder.push(row);
        }
    }

    let (train_ratio, val_ratio, _) = config.ratios;
    let renorm = train_ratio + val_ratio;
    let ratios = if renorm > 0.0 {
        (train_ratio / renorm, val_ratio / renorm, 0.0)
    } else {
        (1.0, 0.0, 0.0)
    };
    let (train, validation, _) = stratified_partition(remainder, ratios);
    SplitResult { train, validation, test }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GroupBy, SplitStrategy};
    use chrono::Utc;
    use std::collections::BTreeMap as Map;
    use uuid::Uuid;

    fn row(group: &str, outcome: u8) -> DatasetRow {
        DatasetRow {
            enrichment_build_id: Uuid::new_v4(),
            raw_repo_id: Uuid::new_v4(),
            primary_language: None,
            build_started_at: Some(Utc::now()),
            outcome: Some(outcome),
            features: Map::new(),
            group_value: Some(group.to_string()),
        }
    }

    fn config(strategy: SplitStrategy) -> SplittingConfig {
        SplittingConfig {
            strategy,
            group_by: GroupBy::LanguageGroup,
            ratios: (0.7, 0.15, 0.15),
            stratify_by: "outcome".to_string(),
            test_groups: Vec::new(),
            val_groups: Vec::new(),
            train_groups: Vec::new(),
            reduce_label: 1,
            reduce_ratio: 0.5,
            novelty_group: None,
            novelty_label: 1,
            temporal_ordering: true,
        }
    }

    #[test]
    fn small_groups_stay_entirely_in_train() {
        let rows = vec![row("rust", 0), row("rust", 1)];
        let result = stratified_within_group(rows, (0.7, 0.15, 0.15));
        assert_eq!(result.train.len(), 2);
        assert!(result.validation.is_empty());
        assert!(result.test.is_empty());
    }

    #[test]
    fn stratified_split_distributes_larger_groups_across_partitions() {
        let rows: Vec<DatasetRow> = (0..20).map(|i| row("rust", (i % 2) as u8)).collect();
        let result = stratified_within_group(rows, (0.7, 0.15, 0.15));
        assert_eq!(result.train.len() + result.validation.len() + result.test.len(), 20);
        assert!(!result.test.is_empty());
    }

    #[test]
    fn leave_one_out_holds_an_entire_group_out_for_test() {
        let mut rows: Vec<DatasetRow> = (0..10).map(|i| row("rust", (i % 2) as u8)).collect();
        rows.extend((0..10).map(|i| row("go", (i % 2) as u8)));
        let cfg = config(SplitStrategy::LeaveOneOut);
        let result = leave_groups_out(rows, &cfg, false);
        assert!(result.test.iter().all(|r| r.group_value.as_deref() == Some("go")));
        assert!(result.train.iter().chain(result.validation.iter()).all(|r| r.group_value.as_deref() == Some("rust")));
    }

    #[test]
    fn leave_groups_out_falls_back_when_not_enough_groups() {
        let rows: Vec<DatasetRow> = (0..10).map(|i| row("only_group", (i % 2) as u8)).collect();
        let cfg = config(SplitStrategy::LeaveOneOut);
        let result = leave_groups_out(rows, &cfg, false);
        assert_eq!(result.train.len() + result.validation.len() + result.test.len(), 10);
    }

    #[test]
    fn imbalanced_train_reduces_the_target_label_deterministically() {
        let rows: Vec<DatasetRow> = (0..40).map(|i| row("rust", (i % 2) as u8)).collect();
        let cfg = config(SplitStrategy::ImbalancedTrain);
        let before_count = rows.iter().filter(|r| r.outcome == Some(1)).count();
        let result = imbalanced_train(rows, &cfg);
        let after_count = result.train.iter().filter(|r| r.outcome == Some(1)).count();
        assert!(after_count < before_count);
    }

    #[test]
    fn extreme_novelty_reserves_matching_rows_for_test() {
        let mut rows: Vec<DatasetRow> = (0..10).map(|i| row("rust", (i % 2) as u8)).collect();
        rows.extend((0..10).map(|i| row("cobol", (i % 2) as u8)));
        let mut cfg = config(SplitStrategy::ExtremeNovelty);
        cfg.novelty_group = Some("cobol".to_string());
        cfg.novelty_label = 1;
        let result = extreme_novelty(rows, &cfg);
        assert!(result
            .test
            .iter()
            .all(|r| r.group_value.as_deref() == Some("cobol") && r.outcome == Some(1)));
    }
}
