//! Entropy features over file-change distributions (Shannon entropy of the
//! changed-file extension histogram — a high-entropy commit touches many
//! unrelated parts of the tree).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::domain::FeatureValue;
use crate::feature_dag::{ExecutionContext, FeatureNode, FeatureNodeBody, ResourceHandle, ResourceRequirement};

struct FileChangeEntropy;

#[async_trait]
impl FeatureNodeBody for FileChangeEntropy {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String> {
        let Some(ResourceHandle::GitWorktree { path, .. }) = ctx.get_resource(ResourceRequirement::GitWorktree) else {
            return Err("git_worktree resource handle missing".to_string());
        };

        let output = Command::new("git")
            .arg("--git-dir")
            .arg(format!("{path}/.git"))
            .args(["show", "--name-only", "--format="])
            .output()
            .await
            .map_err(|e| e.to_string())?;
        let names = String::from_utf8_lossy(&output.stdout);

        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut total = 0u32;
        for name in names.lines().filter(|l| !l.is_empty()) {
            let ext = std::path::Path::new(name)
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_else(|| "noext".to_string());
            *counts.entry(ext).or_default() += 1;
            total += 1;
        }

        let entropy = if total == 0 {
            0.0
        } else {
            counts
                .values()
                .map(|&c| {
                    let p = c as f64 / total as f64;
                    -p * p.log2()
                })
                .sum::<f64>()
        };

        let mut out = BTreeMap::new();
        out.insert("git_change_entropy".to_string(), FeatureValue::Number(entropy));
        out.insert("git_distinct_extensions".to_string(), FeatureValue::Number(counts.len() as f64));
        Ok(out)
    }
}

pub fn register(map: &mut HashMap<&'static str, FeatureNode>) {
    map.insert(
        "entropy_file_change",
        FeatureNode {
            name: "entropy_file_change",
            provides: &["git_change_entropy", "git_distinct_extensions"],
            requires_features: &[],
            requires_resources: &[ResourceRequirement::GitWorktree],
            group: "entropy",
            null_tolerant: false,
            body: Arc::new(FileChangeEntropy),
        },
    );
}
