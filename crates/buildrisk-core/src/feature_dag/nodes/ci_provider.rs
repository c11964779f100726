//! Collaboration signals and discussion-related counts sourced from the
//! CI-provider API client (e.g. PR review/comment counts attached to the
//! build's `jobs_metadata` by the Ingestion Workers before this node runs).
//! Feature keys use the `gh_` prefix so they resolve under the `gh_*`
//! wildcard a scenario's feature selection names.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::FeatureValue;
use crate::feature_dag::{ExecutionContext, FeatureNode, FeatureNodeBody, ResourceRequirement};

struct CollaborationSignals;

#[async_trait]
impl FeatureNodeBody for CollaborationSignals {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let metadata = &ctx.build.jobs_metadata;
        let reviewers = metadata.get("reviewer_count").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let comments = metadata.get("comment_count").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let distinct_authors = metadata.get("distinct_author_count").and_then(|v| v.as_f64()).unwrap_or(1.0);

        let mut out = BTreeMap::new();
        out.insert("gh_reviewer_count".to_string(), FeatureValue::Number(reviewers));
        out.insert("gh_num_pr_comments".to_string(), FeatureValue::Number(comments));
        out.insert("gh_team_size".to_string(), FeatureValue::Number(distinct_authors));
        Ok(out)
    }
}

pub fn register(map: &mut HashMap<&'static str, FeatureNode>) {
    map.insert(
        "ci_provider_collaboration_signals",
        FeatureNode {
            name: "ci_provider_collaboration_signals",
            provides: &["gh_reviewer_count", "gh_num_pr_comments", "gh_team_size"],
            requires_features: &[],
            requires_resources: &[ResourceRequirement::GithubClient],
            group: "ci_provider",
            null_tolerant: false,
            body: Arc::new(CollaborationSignals),
        },
    );
}
