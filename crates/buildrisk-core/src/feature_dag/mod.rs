//! Feature DAG Engine (C6): resolves a requested feature set into nodes,
//! orders them topologically, and executes them with resource injection and
//! graceful degradation.
//!
//! Resolution's topological sort reuses the same Kahn's-algorithm shape as
//! the Resource DAG (C3), applied over a feature-level dependency graph
//! instead of a repo-level one. The static registry is a process-wide
//! immutable-after-initialisation `Lazy<HashMap<...>>`, consistent with the
//! teacher's global-state design note.

mod nodes;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::domain::{FeatureValue, RawBuildRun, RawRepository};

/// Resources a feature node may require. A superset of the Resource DAG's
/// `ResourceName`: `github_client` and `workflow_run` are in-process
/// resources that need no ingestion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRequirement {
    GitHistory,
    GitWorktree,
    BuildLogs,
    GithubClient,
    WorkflowRun,
}

/// An opaque, already-acquired resource handed to a node body.
#[derive(Debug, Clone)]
pub enum ResourceHandle {
    GitHistory { bare_repo_path: String },
    GitWorktree { path: String, effective_sha: String, is_commit_available: bool },
    BuildLogs { raw_text: String },
    GithubClient,
    WorkflowRun { payload: serde_json::Value },
}

/// Per-build execution context handed to every node body.
pub struct ExecutionContext<'a> {
    pub build: &'a RawBuildRun,
    pub repo: &'a RawRepository,
    /// Features computed by nodes at a strictly lower level.
    pub features: &'a BTreeMap<String, FeatureValue>,
    pub resources: &'a HashMap<ResourceRequirement, ResourceHandle>,
}

impl ExecutionContext<'_> {
    pub fn get_resource(&self, name: ResourceRequirement) -> Option<&ResourceHandle> {
        self.resources.get(&name)
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }
}

/// A feature node's executable body.
#[async_trait]
pub trait FeatureNodeBody: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<BTreeMap<String, FeatureValue>, String>;
}

/// One entry in the static feature registry.
pub struct FeatureNode {
    pub name: &'static str,
    pub provides: &'static [&'static str],
    pub requires_features: &'static [&'static str],
    pub requires_resources: &'static [ResourceRequirement],
    pub group: &'static str,
    /// Whether this node tolerates `None`-valued required features instead
    /// of being skipped.
    pub null_tolerant: bool,
    pub body: Arc<dyn FeatureNodeBody>,
}

static REGISTRY: Lazy<HashMap<&'static str, FeatureNode>> = Lazy::new(|| {
    let mut map = HashMap::new();
    nodes::git::register(&mut map);
    nodes::build_log::register(&mut map);
    nodes::devops::register(&mut map);
    nodes::history::register(&mut map);
    nodes::entropy::register(&mut map);
    nodes::ci_provider::register(&mut map);
    map
});

pub fn registry() -> &'static HashMap<&'static str, FeatureNode> {
    &REGISTRY
}

/// Expand a wildcard (e.g. `gh_*`, `git_*`, `tr_*`, `history_*`) against
/// every feature any registered node provides. Matching is a plain prefix
/// test, so any registered prefix resolves, not just those three.
fn expand_wildcard(pattern: &str) -> Vec<String> {
    let prefix = pattern.trim_end_matches('*');
    REGISTRY
        .values()
        .flat_map(|n| n.provides.iter())
        .filter(|f| f.starts_with(prefix))
        .map(|f| f.to_string())
        .collect()
}

/// Expand a requested feature set, resolving wildcards (entries ending in
/// `*`) against the registry.
pub fn expand_requested_features(requested: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for f in requested {
        if f.ends_with('*') {
            out.extend(expand_wildcard(f));
        } else {
            out.push(f.clone());
        }
    }
    out.sort();
    out.dedup();
    out
}

fn provider_of(feature: &str) -> Option<&'static FeatureNode> {
    REGISTRY.values().find(|n| n.provides.contains(&feature))
}

/// A resolved, dependency-ordered plan: levels of node names, each runnable
/// in parallel within its level.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub levels: Vec<Vec<&'static str>>,
    pub required_resources: HashSet<ResourceRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError(pub Vec<&'static str>);

/// Resolve a requested feature set into a topologically-ordered node plan.
///
/// 1. Expand wildcards.
/// 2. Seed a worklist with the providers of the requested features,
///    recursively pulling in providers of each selected node's
///    `requires_features`. Cycles are rejected.
/// 3. Union every selected node's `requires_resources`.
/// 4. Kahn's algorithm over feature-level dependency edges (node A depends
///    on node B if A requires a feature B provides); level 0 has no
///    incoming edges.
pub fn resolve(requested: &[String]) -> Result<ResolvedPlan, CycleError> {
    let expanded = expand_requested_features(requested);

    let mut selected: HashMap<&'static str, &'static FeatureNode> = HashMap::new();
    let mut worklist: VecDeque<&'static str> = VecDeque::new();

    for feature in &expanded {
        if let Some(node) = provider_of(feature) {
            if selected.insert(node.name, node).is_none() {
                worklist.push_back(node.name);
            }
        }
    }

    while let Some(name) = worklist.pop_front() {
        let node = selected[name];
        for req in node.requires_features {
            if let Some(provider) = provider_of(req) {
                if selected.insert(provider.name, provider).is_none() {
                    worklist.push_back(provider.name);
                }
            }
        }
    }

    // Build feature-level dependency edges: dependent -> dependency.
    let mut in_degree: HashMap<&'static str, usize> = selected.keys().map(|k| (*k, 0)).collect();
    let mut dependents: HashMap<&'static str, Vec<&'static str>> = HashMap::new();

    let selected_names: Vec<&'static str> = selected.keys().copied().collect();
    for &name in &selected_names {
        let node = selected[name];
        for req in node.requires_features {
            let provider = selected.values().find(|n| n.provides.contains(req));
            if let Some(provider) = provider {
                if provider.name != node.name {
                    *in_degree.get_mut(node.name).unwrap() += 1;
                    dependents.entry(provider.name).or_default().push(node.name);
                }
            }
        }
    }

    let mut queue: VecDeque<&'static str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut queue_sorted: Vec<&'static str> = queue.drain(..).collect();
    queue_sorted.sort_unstable();
    queue.extend(queue_sorted);

    let mut levels: Vec<Vec<&'static str>> = Vec::new();
    let mut visited = 0usize;

    let mut frontier: Vec<&'static str> = queue.into_iter().collect();
    while !frontier.is_empty() {
        frontier.sort_unstable();
        visited += frontier.len();
        let mut next_frontier: Vec<&'static str> = Vec::new();
        for &name in &frontier {
            if let Some(deps) = dependents.get(name) {
                for &dep in deps {
                    let deg = in_degree.get_mut(dep).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        next_frontier.push(dep);
                    }
                }
            }
        }
        levels.push(frontier);
        frontier = next_frontier;
    }

    if visited != selected.len() {
        let remaining: Vec<&'static str> = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(name, _)| name)
            .collect();
        return Err(CycleError(remaining));
    }

    let mut required_resources = HashSet::new();
    for node in selected.values() {
        required_resources.extend(node.requires_resources.iter().copied());
    }

    Ok(ResolvedPlan { levels, required_resources })
}

/// Outcome of running one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRunOutcome {
    Succeeded,
    Skipped(String),
    Failed(String),
}

/// Execute a resolved plan level-by-level. Returns the merged feature
/// values plus a per-node outcome list (in execution order) for the
/// FeatureAuditLog.
pub async fn execute(
    plan: &ResolvedPlan,
    build: &RawBuildRun,
    repo: &RawRepository,
    available_resources: &HashMap<ResourceRequirement, ResourceHandle>,
    parallelism: usize,
) -> (BTreeMap<String, FeatureValue>, Vec<(&'static str, NodeRunOutcome)>) {
    let mut features: BTreeMap<String, FeatureValue> = BTreeMap::new();
    let mut outcomes: Vec<(&'static str, NodeRunOutcome)> = Vec::new();

    for level in &plan.levels {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(parallelism.max(1)));
        let mut handles = Vec::new();

        for &name in level {
            let node = &registry()[name];
            let missing_resource = node
                .requires_resources
                .iter()
                .find(|r| !available_resources.contains_key(r));
            let missing_feature = node.requires_features.iter().find(|f| {
                matches!(features.get(**f), Some(v) if v.is_null()) && !node.null_tolerant
            });

            if let Some(missing) = missing_resource {
                outcomes.push((name, NodeRunOutcome::Skipped(format!("missing resource {missing:?}"))));
                for f in node.provides {
                    features.insert(f.to_string(), FeatureValue::Null);
                }
                continue;
            }
            if let Some(missing) = missing_feature {
                outcomes.push((name, NodeRunOutcome::Skipped(format!("required feature '{missing}' is null"))));
                for f in node.provides {
                    features.insert(f.to_string(), FeatureValue::Null);
                }
                continue;
            }

            let permit = Arc::clone(&semaphore);
            let ctx_features = features.clone();
            let body = Arc::clone(&node.body);
            let provides = node.provides;
            let build = build.clone();
            let repo = repo.clone();
            let resources = available_resources.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                let ctx = ExecutionContext {
                    build: &build,
                    repo: &repo,
                    features: &ctx_features,
                    resources: &resources,
                };
                let result = body.execute(&ctx).await;
                (name, provides, result)
            });
            handles.push(handle);
        }

        for handle in handles {
            let (name, provides, result) = handle.await.expect("feature node task panicked");
            match result {
                Ok(values) => {
                    features.extend(values);
                    outcomes.push((name, NodeRunOutcome::Succeeded));
                }
                Err(message) => {
                    for f in provides {
                        features.entry(f.to_string()).or_insert(FeatureValue::Null);
                    }
                    outcomes.push((name, NodeRunOutcome::Failed(message)));
                }
            }
        }
    }

    (features, outcomes)
}

/// Overall extraction status from per-node outcomes, per the `completed` /
/// `partial` / `failed` contract.
pub fn summarize(outcomes: &[(&'static str, NodeRunOutcome)]) -> crate::domain::ExtractionStatus {
    use crate::domain::ExtractionStatus;
    let succeeded = outcomes.iter().filter(|(_, o)| *o == NodeRunOutcome::Succeeded).count();
    let total = outcomes.len();
    if total == 0 {
        return ExtractionStatus::Completed;
    }
    if succeeded == total {
        ExtractionStatus::Completed
    } else if succeeded == 0 {
        ExtractionStatus::Failed
    } else {
        ExtractionStatus::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_expansion_matches_registry_prefix() {
        let expanded = expand_requested_features(&["git_*".to_string()]);
        assert!(expanded.iter().all(|f| f.starts_with("git_")));
        assert!(!expanded.is_empty());
    }

    #[test]
    fn resolve_orders_dependent_nodes_after_their_providers() {
        let plan = resolve(&["git_churn_ratio".to_string()]).unwrap();
        assert!(!plan.levels.is_empty());
    }

    #[tokio::test]
    async fn execute_skips_nodes_missing_required_resources() {
        let repo = RawRepository::new("org/repo", "1");
        let build = RawBuildRun::new(repo.id, "run-1", "github_actions", "deadbeef");
        let plan = resolve(&["git_commit_count".to_string()]).unwrap();
        let (features, outcomes) = execute(&plan, &build, &repo, &HashMap::new(), 4).await;
        assert!(outcomes.iter().any(|(_, o)| matches!(o, NodeRunOutcome::Skipped(_))));
        assert!(features.values().any(|v| v.is_null()));
    }

    #[test]
    fn summarize_reports_completed_when_all_nodes_succeed() {
        let outcomes = vec![("a", NodeRunOutcome::Succeeded), ("b", NodeRunOutcome::Succeeded)];
        assert_eq!(summarize(&outcomes), crate::domain::ExtractionStatus::Completed);
    }

    #[test]
    fn summarize_reports_partial_when_some_nodes_skip() {
        let outcomes = vec![("a", NodeRunOutcome::Succeeded), ("b", NodeRunOutcome::Skipped("x".into()))];
        assert_eq!(summarize(&outcomes), crate::domain::ExtractionStatus::Partial);
    }

    #[test]
    fn summarize_reports_failed_when_no_nodes_succeed() {
        let outcomes = vec![("a", NodeRunOutcome::Failed("x".into()))];
        assert_eq!(summarize(&outcomes), crate::domain::ExtractionStatus::Failed);
    }
}
