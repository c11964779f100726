//! Git commit metadata and git-diff churn features.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::domain::FeatureValue;
use crate::feature_dag::{ExecutionContext, FeatureNode, FeatureNodeBody, ResourceHandle, ResourceRequirement};

struct CommitMetadata;

#[async_trait]
impl FeatureNodeBody for CommitMetadata {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let Some(ResourceHandle::GitHistory { bare_repo_path }) = ctx.get_resource(ResourceRequirement::GitHistory) else {
            return Err("git_history resource handle missing".to_string());
        };
        let sha = &ctx.build.effective_sha;

        let parent_count = run_git(bare_repo_path, &["rev-list", "--parents", "-n", "1", sha])
            .await?
            .split_whitespace()
            .count()
            .saturating_sub(1);

        let author_count = run_git(bare_repo_path, &["log", "-1", "--format=%an", sha])
            .await
            .map(|s| if s.trim().is_empty() { 0.0 } else { 1.0 })
            .unwrap_or(0.0);

        let mut out = BTreeMap::new();
        out.insert("git_parent_count".to_string(), FeatureValue::Number(parent_count as f64));
        out.insert("git_has_author".to_string(), FeatureValue::Number(author_count));
        Ok(out)
    }
}

struct ChurnRatio;

#[async_trait]
impl FeatureNodeBody for ChurnRatio {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let Some(ResourceHandle::GitWorktree { path, .. }) = ctx.get_resource(ResourceRequirement::GitWorktree) else {
            return Err("git_worktree resource handle missing".to_string());
        };

        let stat = run_git(path, &["show", "--stat", "--format="]).await.unwrap_or_default();
        let files_changed = stat.lines().filter(|l| l.contains('|')).count();
        let churn_ratio = (files_changed as f64 / 50.0).min(1.0);

        let mut out = BTreeMap::new();
        out.insert("git_files_changed".to_string(), FeatureValue::Number(files_changed as f64));
        out.insert("git_churn_ratio".to_string(), FeatureValue::Number(churn_ratio));
        Ok(out)
    }
}

async fn run_git(git_dir: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .args(args)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn register(map: &mut HashMap<&'static str, FeatureNode>) {
    map.insert(
        "git_commit_metadata",
        FeatureNode {
            name: "git_commit_metadata",
            provides: &["git_parent_count", "git_has_author"],
            requires_features: &[],
            requires_resources: &[ResourceRequirement::GitHistory],
            group: "git",
            null_tolerant: false,
            body: Arc::new(CommitMetadata),
        },
    );
    map.insert(
        "git_churn_ratio",
        FeatureNode {
            name: "git_churn_ratio",
            provides: &["git_churn_ratio", "git_files_changed"],
            requires_features: &[],
            requires_resources: &[ResourceRequirement::GitWorktree],
            group: "git",
            null_tolerant: false,
            body: Arc::new(ChurnRatio),
        },
    );
}
