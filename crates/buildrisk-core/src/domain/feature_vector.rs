//! `FeatureVector` — the sole source of truth for extracted features.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::enrichment_build::ExtractionStatus;

/// Which pipeline kind owns a FeatureVector. `ModelTraining` is carried for
/// data-model fidelity with the upstream system; this crate only ever
/// produces `Scenario`-scoped vectors (model training is out of scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureScope {
    Scenario,
    ModelTraining,
}

/// A single feature value: scalar or list, with explicit-null support so
/// missing-value handling can distinguish "never computed" from "computed
/// as zero".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Text(String),
    Bool(bool),
    List(Vec<f64>),
    Null,
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Number(n) => Some(*n),
            FeatureValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FeatureValue::Null)
    }
}

/// The computed feature set for one build under one scope.
///
/// Invariant: one FeatureVector per `(scope, raw_build_run_id)`. `features`
/// and `scan_metrics` are kept in separate maps because scan metrics are
/// filled in asynchronously by the Scan Dispatcher (§4.7) after the Feature
/// DAG Engine has already written the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub id: Uuid,
    pub scope: FeatureScope,
    /// Scenario id (the only scope this crate populates).
    pub scope_id: Uuid,
    pub raw_repo_id: Uuid,
    pub raw_build_run_id: Uuid,
    pub features: BTreeMap<String, FeatureValue>,
    /// Keys prefixed `sonar_` / `trivy_`.
    pub scan_metrics: BTreeMap<String, FeatureValue>,
    pub skipped: BTreeMap<String, String>,
    pub extraction_status: ExtractionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeatureVector {
    pub fn new(scope_id: Uuid, raw_repo_id: Uuid, raw_build_run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scope: FeatureScope::Scenario,
            scope_id,
            raw_repo_id,
            raw_build_run_id,
            features: BTreeMap::new(),
            scan_metrics: BTreeMap::new(),
            skipped: BTreeMap::new(),
            extraction_status: ExtractionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: FeatureValue) {
        self.features.insert(name.into(), value);
    }

    pub fn set_scan_metric(&mut self, name: impl Into<String>, value: FeatureValue) {
        self.scan_metrics.insert(name.into(), value);
    }

    pub fn skip(&mut self, name: impl Into<String>, reason: impl Into<String>) {
        self.skipped.insert(name.into(), reason.into());
    }

    /// Count of feature (not scan-metric) values that are present but null,
    /// the quantity `MissingValueStrategy` acts on.
    pub fn missing_count(&self) -> usize {
        self.features.values().filter(|v| v.is_null()).count()
    }

    /// All columns the split phase will materialize for this build: feature
    /// names plus scan-metric keys, in a stable order.
    pub fn column_names(&self) -> Vec<&str> {
        self.features
            .keys()
            .chain(self.scan_metrics.keys())
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_count_tallies_null_feature_values_only() {
        let mut vector = FeatureVector::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        vector.set("a", FeatureValue::Number(1.0));
        vector.set("b", FeatureValue::Null);
        vector.set_scan_metric("sonar_coverage", FeatureValue::Null);
        assert_eq!(vector.missing_count(), 1);
    }

    #[test]
    fn bool_as_f64_maps_to_zero_or_one() {
        assert_eq!(FeatureValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(FeatureValue::Bool(false).as_f64(), Some(0.0));
    }

    #[test]
    fn skipped_features_tracked_separately_from_values() {
        let mut vector = FeatureVector::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        vector.skip("sq_coverage", "scan not completed");
        assert!(vector.features.is_empty());
        assert_eq!(
            vector.skipped.get("sq_coverage").map(String::as_str),
            Some("scan not completed")
        );
    }

    #[test]
    fn scan_metrics_kept_separate_from_dag_features() {
        let mut vector = FeatureVector::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        vector.set("git_lines_changed", FeatureValue::Number(42.0));
        vector.set_scan_metric("trivy_critical_count", FeatureValue::Number(2.0));
        assert_eq!(vector.column_names().len(), 2);
        assert!(!vector.scan_metrics.contains_key("git_lines_changed"));
    }

    #[test]
    fn new_defaults_to_scenario_scope() {
        let vector = FeatureVector::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(vector.scope, FeatureScope::Scenario);
    }
}
