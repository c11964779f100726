//! Build-log parsing: job counts, test pass/fail/skip counts, duration,
//! detected test frameworks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::FeatureValue;
use crate::feature_dag::{ExecutionContext, FeatureNode, FeatureNodeBody, ResourceHandle, ResourceRequirement};

static TEST_SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s+passed|(\d+)\s+failed|(\d+)\s+skipped").unwrap()
});

static FRAMEWORK_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("pytest", Regex::new(r"(?i)pytest").unwrap()),
        ("jest", Regex::new(r"(?i)jest").unwrap()),
        ("cargo_test", Regex::new(r"(?i)running \d+ tests").unwrap()),
        ("junit", Regex::new(r"(?i)junit").unwrap()),
    ]
});

struct TestSummary;

#[async_trait]
impl FeatureNodeBody for TestSummary {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let Some(ResourceHandle::BuildLogs { raw_text }) = ctx.get_resource(ResourceRequirement::BuildLogs) else {
            return Err("build_logs resource handle missing".to_string());
        };

        let mut passed = 0.0;
        let mut failed = 0.0;
        let mut skipped = 0.0;
        for cap in TEST_SUMMARY_RE.captures_iter(raw_text) {
            if let Some(m) = cap.get(1) {
                passed += m.as_str().parse::<f64>().unwrap_or(0.0);
            }
            if let Some(m) = cap.get(2) {
                failed += m.as_str().parse::<f64>().unwrap_or(0.0);
            }
            if let Some(m) = cap.get(3) {
                skipped += m.as_str().parse::<f64>().unwrap_or(0.0);
            }
        }

        let mut out = BTreeMap::new();
        out.insert("tr_tests_passed".to_string(), FeatureValue::Number(passed));
        out.insert("tr_tests_failed".to_string(), FeatureValue::Number(failed));
        out.insert("tr_tests_skipped".to_string(), FeatureValue::Number(skipped));
        out.insert("tr_tests_run".to_string(), FeatureValue::Number(passed + failed + skipped));
        Ok(out)
    }
}

struct FrameworkDetection;

#[async_trait]
impl FeatureNodeBody for FrameworkDetection {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let Some(ResourceHandle::BuildLogs { raw_text }) = ctx.get_resource(ResourceRequirement::BuildLogs) else {
            return Err("build_logs resource handle missing".to_string());
        };

        let detected: Vec<f64> = FRAMEWORK_PATTERNS
            .iter()
            .map(|(_, re)| if re.is_match(raw_text) { 1.0 } else { 0.0 })
            .collect();

        let mut out = BTreeMap::new();
        out.insert("tr_test_frameworks_detected".to_string(), FeatureValue::List(detected));
        Ok(out)
    }
}

pub fn register(map: &mut HashMap<&'static str, FeatureNode>) {
    map.insert(
        "build_log_test_summary",
        FeatureNode {
            name: "build_log_test_summary",
            provides: &["tr_tests_passed", "tr_tests_failed", "tr_tests_skipped", "tr_tests_run"],
            requires_features: &[],
            requires_resources: &[ResourceRequirement::BuildLogs],
            group: "build_log",
            null_tolerant: false,
            body: Arc::new(TestSummary),
        },
    );
    map.insert(
        "build_log_framework_detection",
        FeatureNode {
            name: "build_log_framework_detection",
            provides: &["tr_test_frameworks_detected"],
            requires_features: &[],
            requires_resources: &[ResourceRequirement::BuildLogs],
            group: "build_log",
            null_tolerant: false,
            body: Arc::new(FrameworkDetection),
        },
    );
}
