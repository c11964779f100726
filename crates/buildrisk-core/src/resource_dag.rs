//! Resource DAG (C3): orders resource-acquisition tasks for a scenario's
//! required feature set.
//!
//! The resource set is fixed and tiny (three resources), so unlike the
//! teacher's general-purpose `multi_repo::graph::RepoDependencyGraph` this
//! is a small hand-built adjacency map rather than a reusable graph type —
//! also why this workspace does not carry the teacher's `oxidizedgraph`
//! dependency forward (see DESIGN.md).

use crate::domain::ResourceName;

/// One level of the resource-acquisition plan: resources at the same level
/// may be fetched in parallel; level *k+1* may consume level ≤ *k*'s output.
pub type ResourceLevels = Vec<Vec<ResourceName>>;

/// Resolve the minimal, dependency-ordered set of resource-acquisition
/// levels for `required`. `git_worktree` depends on `git_history`;
/// `build_logs` has no git dependency and runs in parallel with clone.
///
/// Resources whose absence forces whole-scenario failure are ordered
/// earliest — `git_history` is the sole forcing resource here (without it,
/// nothing checked out against a commit is possible), so it always leads
/// when requested.
pub fn resolve(required: &[ResourceName], scan_enabled: bool) -> ResourceLevels {
    let mut wanted: Vec<ResourceName> = required.to_vec();

    // Scanners run against a checked-out tree: force git_worktree into the
    // required set even if no feature directly depends on it.
    if scan_enabled && !wanted.contains(&ResourceName::GitWorktree) {
        wanted.push(ResourceName::GitWorktree);
    }
    // git_worktree depends on git_history; pull it in transitively.
    if wanted.contains(&ResourceName::GitWorktree) && !wanted.contains(&ResourceName::GitHistory) {
        wanted.push(ResourceName::GitHistory);
    }

    let mut levels = ResourceLevels::new();

    let mut level0: Vec<ResourceName> = Vec::new();
    if wanted.contains(&ResourceName::GitHistory) {
        level0.push(ResourceName::GitHistory);
    }
    if wanted.contains(&ResourceName::BuildLogs) {
        level0.push(ResourceName::BuildLogs);
    }
    level0.sort_by_key(resource_rank);
    if !level0.is_empty() {
        levels.push(level0);
    }

    if wanted.contains(&ResourceName::GitWorktree) {
        levels.push(vec![ResourceName::GitWorktree]);
    }

    levels
}

/// Deterministic tie-break: resources that force whole-scenario failure if
/// missing sort earliest within a level.
fn resource_rank(name: &ResourceName) -> u8 {
    match name {
        ResourceName::GitHistory => 0,
        ResourceName::BuildLogs => 1,
        ResourceName::GitWorktree => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_worktree_never_precedes_git_history() {
        let levels = resolve(&[ResourceName::GitHistory, ResourceName::GitWorktree], false);
        let history_level = levels.iter().position(|l| l.contains(&ResourceName::GitHistory)).unwrap();
        let worktree_level = levels.iter().position(|l| l.contains(&ResourceName::GitWorktree)).unwrap();
        assert!(history_level < worktree_level);
    }

    #[test]
    fn build_logs_runs_parallel_with_clone() {
        let levels = resolve(&[ResourceName::GitHistory, ResourceName::BuildLogs], false);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 2);
    }

    #[test]
    fn scan_enabled_forces_git_worktree_even_if_unrequested() {
        let levels = resolve(&[ResourceName::BuildLogs], true);
        assert!(levels.iter().flatten().any(|r| *r == ResourceName::GitWorktree));
        assert!(levels.iter().flatten().any(|r| *r == ResourceName::GitHistory));
    }

    #[test]
    fn requesting_only_build_logs_skips_git_entirely() {
        let levels = resolve(&[ResourceName::BuildLogs], false);
        assert!(!levels.iter().flatten().any(|r| *r == ResourceName::GitHistory));
        assert!(!levels.iter().flatten().any(|r| *r == ResourceName::GitWorktree));
    }

    #[test]
    fn empty_requirement_produces_no_levels() {
        let levels = resolve(&[], false);
        assert!(levels.is_empty());
    }
}
