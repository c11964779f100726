//! DevOps configuration-file detection: scans a checked-out worktree for
//! known CI/IaC patterns.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::FeatureValue;
use crate::feature_dag::{ExecutionContext, FeatureNode, FeatureNodeBody, ResourceHandle, ResourceRequirement};

/// `(feature name, path-matching pattern)`. Patterns are matched against
/// paths relative to the worktree root, recovered from
/// `pipeline/feature_dag/devops_features.py`.
static DEVOPS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("gh_has_github_actions", Regex::new(r"^\.github/workflows/.*\.ya?ml$").unwrap()),
        ("gh_has_dockerfile", Regex::new(r"(^|/)Dockerfile[^/]*$").unwrap()),
        ("gh_has_terraform", Regex::new(r"\.tf$").unwrap()),
        ("gh_has_docker_compose", Regex::new(r"(^|/)docker-compose[^/]*\.ya?ml$").unwrap()),
        ("gh_has_jenkinsfile", Regex::new(r"(^|/)Jenkinsfile$").unwrap()),
        ("gh_has_gitlab_ci", Regex::new(r"(^|/)\.gitlab-ci\.ya?ml$").unwrap()),
        ("gh_has_helm_chart", Regex::new(r"^helm/.*\.ya?ml$").unwrap()),
        ("gh_has_k8s_manifest", Regex::new(r"^k8s/.*\.ya?ml$").unwrap()),
    ]
});

struct DevopsConfigDetection;

#[async_trait]
impl FeatureNodeBody for DevopsConfigDetection {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let Some(ResourceHandle::GitWorktree { path, .. }) = ctx.get_resource(ResourceRequirement::GitWorktree) else {
            return Err("git_worktree resource handle missing".to_string());
        };

        let paths = walk_relative_paths(path).map_err(|e| e.to_string())?;
        let mut out = BTreeMap::new();
        for (feature, pattern) in DEVOPS_PATTERNS.iter() {
            let matched = paths.iter().any(|p| pattern.is_match(p));
            out.insert(feature.to_string(), FeatureValue::Bool(matched));
        }
        Ok(out)
    }
}

fn walk_relative_paths(root: &str) -> std::io::Result<Vec<String>> {
    let root_path = std::path::Path::new(root);
    let mut out = Vec::new();
    let mut stack = vec![root_path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root_path) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(out)
}

pub fn register(map: &mut HashMap<&'static str, FeatureNode>) {
    map.insert(
        "devops_config_detection",
        FeatureNode {
            name: "devops_config_detection",
            provides: &[
                "gh_has_github_actions",
                "gh_has_dockerfile",
                "gh_has_terraform",
                "gh_has_docker_compose",
                "gh_has_jenkinsfile",
                "gh_has_gitlab_ci",
                "gh_has_helm_chart",
                "gh_has_k8s_manifest",
            ],
            requires_features: &[],
            requires_resources: &[ResourceRequirement::GitWorktree],
            group: "devops",
            null_tolerant: false,
            body: Arc::new(DevopsConfigDetection),
        },
    );
}
