//! Normalization formulas, recovered from
//! `original_source/backend/app/services/normalization_service.py`. Each
//! statistic is computed once over the full row set passed in (the caller
//! is responsible for fitting only on the training partition when that
//! distinction matters) and then applied in place.

use crate::domain::{FeatureValue, NormalizationMethod};

use super::DatasetRow;

pub fn apply(rows: &mut [DatasetRow], feature_names: &[String], method: NormalizationMethod) {
    if method == NormalizationMethod::None {
        return;
    }
    for name in feature_names {
        let values: Vec<f64> = rows.iter().filter_map(|r| r.feature_f64(name)).collect();
        if values.is_empty() {
            continue;
        }
        let transform = build_transform(method, &values);
        for row in rows.iter_mut() {
            if let Some(x) = row.feature_f64(name) {
                row.features.insert(name.clone(), FeatureValue::Number(transform(x)));
            }
        }
    }
}

fn build_transform(method: NormalizationMethod, values: &[f64]) -> Box<dyn Fn(f64) -> f64> {
    match method {
        NormalizationMethod::None => Box::new(|x| x),
        NormalizationMethod::Minmax => {
            let min = min_of(values);
            let max = max_of(values);
            let range = (max - min).max(1e-12);
            Box::new(move |x| (x - min) / range)
        }
        NormalizationMethod::Zscore => {
            let mean = mean_of(values);
            let std = floor_if_nonpositive(std_of(values, mean));
            Box::new(move |x| (x - mean) / std)
        }
        NormalizationMethod::Robust => {
            let median = quantile(values, 0.5);
            let q1 = quantile(values, 0.25);
            let q3 = quantile(values, 0.75);
            let iqr = floor_if_nonpositive(q3 - q1);
            Box::new(move |x| (x - median) / iqr)
        }
        NormalizationMethod::Maxabs => {
            let max_abs = floor_if_nonpositive(values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())));
            Box::new(move |x| x / max_abs)
        }
        NormalizationMethod::Log => {
            let min = min_of(values);
            let shift = -min.min(0.0);
            Box::new(move |x| (1.0 + x + shift).ln())
        }
        NormalizationMethod::Decimal => {
            let max_abs = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            let k = if max_abs < 1.0 { 0 } else { (max_abs.log10().floor() as i32) + 1 };
            let divisor = 10f64.powi(k);
            Box::new(move |x| x / divisor)
        }
    }
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn mean_of(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_of(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Zero-guard only: substitutes 1.0 for a degenerate (non-positive)
/// denominator, but otherwise passes the statistic through unchanged, per
/// `normalization_service.py`'s `x if x > 0 else 1.0`.
fn floor_if_nonpositive(value: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        1.0
    }
}

/// Linear-interpolation quantile over a sorted copy of `values`, matching
/// numpy/pandas' default (`linear`) interpolation.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let rank = q * (n as f64 - 1.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn row(value: f64) -> DatasetRow {
        let mut features = BTreeMap::new();
        features.insert("x".to_string(), FeatureValue::Number(value));
        DatasetRow {
            enrichment_build_id: Uuid::new_v4(),
            raw_repo_id: Uuid::new_v4(),
            primary_language: None,
            build_started_at: None,
            outcome: Some(0),
            features,
            group_value: None,
        }
    }

    #[test]
    fn minmax_scales_into_zero_one() {
        let mut rows = vec![row(0.0), row(5.0), row(10.0)];
        apply(&mut rows, &["x".to_string()], NormalizationMethod::Minmax);
        assert_eq!(rows[0].feature_f64("x"), Some(0.0));
        assert_eq!(rows[2].feature_f64("x"), Some(1.0));
        assert!((rows[1].feature_f64("x").unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn zscore_centers_on_mean_with_floored_std() {
        let mut rows = vec![row(3.0), row(3.0), row(3.0)];
        apply(&mut rows, &["x".to_string()], NormalizationMethod::Zscore);
        assert_eq!(rows[0].feature_f64("x"), Some(0.0));
    }

    #[test]
    fn maxabs_divides_by_the_true_max_abs_when_below_one() {
        let mut rows = vec![row(0.3), row(-0.2)];
        apply(&mut rows, &["x".to_string()], NormalizationMethod::Maxabs);
        assert_eq!(rows[0].feature_f64("x"), Some(1.0));
        assert!((rows[1].feature_f64("x").unwrap() - (-2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn maxabs_floors_zero_denominator_to_one() {
        let mut rows = vec![row(0.0), row(0.0)];
        apply(&mut rows, &["x".to_string()], NormalizationMethod::Maxabs);
        assert_eq!(rows[0].feature_f64("x"), Some(0.0));
    }

    #[test]
    fn zscore_does_not_over_normalize_a_small_but_nonzero_std() {
        let mut rows = vec![row(0.0), row(0.2), row(0.4)];
        apply(&mut rows, &["x".to_string()], NormalizationMethod::Zscore);
        let mean = 0.2;
        let std = ((0.2f64.powi(2) * 2.0) / 3.0).sqrt();
        assert!((rows[0].feature_f64("x").unwrap() - (0.0 - mean) / std).abs() < 1e-9);
    }

    #[test]
    fn log_handles_negative_values_by_shifting() {
        let mut rows = vec![row(-2.0), row(0.0)];
        apply(&mut rows, &["x".to_string()], NormalizationMethod::Log);
        assert!((rows[0].feature_f64("x").unwrap() - 0.0).abs() < 1e-9);
    }
}
