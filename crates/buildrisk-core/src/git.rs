//! Git integration utilities used by the Resource DAG's git_history/git_worktree tasks.

use std::path::Path;
use std::process::Command;

use crate::domain::error::{DomainError, Result};

/// Capture the HEAD commit SHA from a git repository.
///
/// Runs `git rev-parse HEAD` in the given directory. Returns an error if the
/// directory is not inside a git repository or if git is not available.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| DomainError::GitError(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DomainError::GitError(format!(
            "git rev-parse HEAD failed: {stderr}"
        )));
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(DomainError::GitError(
            "git rev-parse HEAD returned empty output".to_string(),
        ));
    }

    Ok(sha)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Clone a bare mirror of `clone_url` into `dest`, the `git_history`
/// resource. Used by the Ingestion Workers' async task bodies.
pub async fn clone_bare(clone_url: &str, dest: &Path) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .args(["clone", "--bare", clone_url])
        .arg(dest)
        .output()
        .await
        .map_err(|e| DomainError::GitError(format!("failed to run git clone: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DomainError::GitError(format!("git clone --bare failed: {stderr}")));
    }
    Ok(())
}

/// Check out `commit_sha` from the bare clone at `bare_repo` into
/// `worktree_dir`, the `git_worktree` resource.
pub async fn checkout_worktree(
    bare_repo: &Path,
    commit_sha: &str,
    worktree_dir: &Path,
) -> Result<()> {
    let output = tokio::process::Command::new("git")
        .arg("--git-dir")
        .arg(bare_repo)
        .args(["worktree", "add", "--detach"])
        .arg(worktree_dir)
        .arg(commit_sha)
        .output()
        .await
        .map_err(|e| DomainError::GitError(format!("failed to run git worktree add: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DomainError::GitError(format!(
            "git worktree add failed for {commit_sha}: {stderr}"
        )));
    }
    Ok(())
}

/// Whether `commit_sha` is reachable in `bare_repo`. A fork commit that
/// isn't reachable signals the caller to fall back to a replay SHA via
/// `RawBuildRun::set_effective_sha`.
pub async fn commit_reachable(bare_repo: &Path, commit_sha: &str) -> bool {
    tokio::process::Command::new("git")
        .arg("--git-dir")
        .arg(bare_repo)
        .args(["cat-file", "-e"])
        .arg(format!("{commit_sha}^{{commit}}"))
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::process::Command as StdCommand;

    fn run_git(repo_dir: &Path, args: &[&str]) {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(repo_dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn make_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init"]);
        run_git(dir.path(), &["config", "user.name", "test-user"]);
        run_git(dir.path(), &["config", "user.email", "test@example.com"]);
        run_git(dir.path(), &["commit", "--allow-empty", "-m", "initial"]);
        dir
    }

    #[test]
    fn capture_head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn capture_head_sha_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        let result = capture_head_sha(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn is_git_repo_true_for_repo() {
        let repo = make_git_repo();
        assert!(is_git_repo(repo.path()));
    }

    #[test]
    fn is_git_repo_false_for_non_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
    }

    #[tokio::test]
    async fn clone_bare_and_checkout_worktree_round_trip() {
        let origin = make_git_repo();
        let sha = capture_head_sha(origin.path()).unwrap();

        let bare = tempfile::tempdir().unwrap();
        let bare_repo = bare.path().join("repo.git");
        clone_bare(origin.path().to_str().unwrap(), &bare_repo)
            .await
            .unwrap();
        assert!(bare_repo.exists());

        assert!(commit_reachable(&bare_repo, &sha).await);

        let worktree_parent = tempfile::tempdir().unwrap();
        let worktree_dir = worktree_parent.path().join("wt");
        checkout_worktree(&bare_repo, &sha, &worktree_dir)
            .await
            .unwrap();
        assert!(worktree_dir.join(".git").exists());
    }

    #[tokio::test]
    async fn commit_reachable_false_for_unknown_sha() {
        let origin = make_git_repo();
        let bare = tempfile::tempdir().unwrap();
        let bare_repo = bare.path().join("repo.git");
        clone_bare(origin.path().to_str().unwrap(), &bare_repo)
            .await
            .unwrap();
        assert!(!commit_reachable(&bare_repo, "0000000000000000000000000000000000dead").await);
    }
}
