//! Build-history features derived by walking the linear previous-build
//! chain. The chain itself is supplied by the caller via `jobs_metadata`
//! (the orchestrator resolves and attaches the previous N builds' outcomes
//! before dispatching this node — see the Scenario Orchestrator's temporal
//! ordering contract). Feature keys use the `history_` prefix so they
//! resolve under the `history_*` wildcard a scenario's feature selection
//! names.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::FeatureValue;
use crate::feature_dag::{ExecutionContext, FeatureNode, FeatureNodeBody};

struct RecentFailureRate;

#[async_trait]
impl FeatureNodeBody for RecentFailureRate {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let history = ctx
            .build
            .jobs_metadata
            .get("previous_outcomes")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let total = history.len();
        let failures = history.iter().filter(|v| v.as_str() == Some("failure")).count();
        let rate = if total == 0 { 0.0 } else { failures as f64 / total as f64 };

        let mut out = BTreeMap::new();
        out.insert("history_fail_rate_10".to_string(), FeatureValue::Number(rate));
        out.insert("history_recent_build_count".to_string(), FeatureValue::Number(total as f64));
        Ok(out)
    }
}

pub fn register(map: &mut HashMap<&'static str, FeatureNode>) {
    map.insert(
        "history_recent_failure_rate",
        FeatureNode {
            name: "history_recent_failure_rate",
            provides: &["history_fail_rate_10", "history_recent_build_count"],
            requires_features: &[],
            requires_resources: &[],
            group: "history",
            null_tolerant: false,
            body: Arc::new(RecentFailureRate),
        },
    );
}
