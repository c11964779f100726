//! Ingestion Workers (C5): Task Runtime bodies that acquire the raw
//! resources (bare clone, worktree checkout, build logs) an `IngestionBuild`
//! needs before Phase 3 can process it.
//!
//! Each struct here is a `buildrisk_core::runtime::Task`; payload shape is
//! documented on the struct since the runtime boundary is untyped JSON.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use buildrisk_core::git;
use buildrisk_core::runtime::{Task, TaskContext, TaskFailure};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::locks::RepoLockRegistry;
use crate::provider::{CiProviderClient, ProviderError};
use std::sync::Arc;

/// `clone_repo` payload/outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRepoInput {
    pub raw_repo_id: String,
    pub clone_url: String,
    pub repos_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRepoOutput {
    pub bare_repo_path: PathBuf,
}

/// Clones (or reuses) a bare mirror of a repository under an advisory
/// per-repo lock so concurrent builds for the same repo don't race the
/// clone directory.
pub struct CloneRepoTask {
    locks: Arc<RepoLockRegistry>,
}

impl CloneRepoTask {
    pub fn new(locks: Arc<RepoLockRegistry>) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl Task for CloneRepoTask {
    async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
        let input: CloneRepoInput = serde_json::from_value(payload)
            .map_err(|e| TaskFailure::fatal(format!("invalid clone_repo payload: {e}")))?;

        let guard = self.locks.acquire(&input.raw_repo_id).await;
        let _held = guard.held().await;

        let bare_repo_path = input.repos_root.join(&input.raw_repo_id);
        if bare_repo_path.exists() {
            return Ok(serde_json::to_value(CloneRepoOutput { bare_repo_path })
                .expect("CloneRepoOutput always serializes"));
        }

        tokio::fs::create_dir_all(&input.repos_root)
            .await
            .map_err(|e| TaskFailure::retryable(format!("failed to create repos root: {e}")))?;

        git::clone_bare(&input.clone_url, &bare_repo_path)
            .await
            .map_err(|e| TaskFailure::retryable(format!("clone failed: {e}")))?;

        Ok(serde_json::to_value(CloneRepoOutput { bare_repo_path })
            .expect("CloneRepoOutput always serializes"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSpec {
    pub commit_sha: String,
    pub parent_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorktreesBatchInput {
    pub raw_repo_id: String,
    pub bare_repo_path: PathBuf,
    pub worktrees_root: PathBuf,
    pub specs: Vec<WorktreeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeOutcome {
    pub commit_sha: String,
    pub effective_sha: String,
    pub worktree_path: PathBuf,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorktreesBatchOutput {
    pub outcomes: Vec<WorktreeOutcome>,
}

/// Checks out one worktree per commit, sequentially per repo (callers chain
/// this after `clone_repo` and hold the same advisory lock). A commit that
/// isn't reachable in the bare clone (a merged-then-deleted fork branch) is
/// replayed: apply its patch against the parent commit and commit the
/// resulting tree, producing a synthetic commit that is reachable.
pub struct CreateWorktreesBatchTask {
    locks: Arc<RepoLockRegistry>,
    ci_client: Arc<dyn CiProviderClient>,
    full_name_by_repo_id: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl CreateWorktreesBatchTask {
    pub fn new(
        locks: Arc<RepoLockRegistry>,
        ci_client: Arc<dyn CiProviderClient>,
        full_name_by_repo_id: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
    ) -> Self {
        Self { locks, ci_client, full_name_by_repo_id }
    }

    async fn replay_fork_commit(
        &self,
        bare_repo_path: &Path,
        full_name: &str,
        commit_sha: &str,
        parent_sha: &str,
    ) -> Result<String, TaskFailure> {
        let patch = self
            .ci_client
            .get_commit_patch(full_name, commit_sha)
            .await
            .map_err(map_provider_error)?;

        let tree_sha = apply_patch_and_write_tree(bare_repo_path, parent_sha, &patch.patch).await?;
        let replay_sha = commit_tree(bare_repo_path, &tree_sha, parent_sha, commit_sha).await?;
        Ok(replay_sha)
    }
}

#[async_trait]
impl Task for CreateWorktreesBatchTask {
    async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
        let input: CreateWorktreesBatchInput = serde_json::from_value(payload)
            .map_err(|e| TaskFailure::fatal(format!("invalid create_worktrees_batch payload: {e}")))?;

        let guard = self.locks.acquire(&input.raw_repo_id).await;
        let _held = guard.held().await;

        tokio::fs::create_dir_all(&input.worktrees_root)
            .await
            .map_err(|e| TaskFailure::retryable(format!("failed to create worktrees root: {e}")))?;

        let mut outcomes = Vec::with_capacity(input.specs.len());
        for spec in &input.specs {
            let mut effective_sha = spec.commit_sha.clone();
            let mut replayed = false;

            if !git::commit_reachable(&input.bare_repo_path, &spec.commit_sha).await {
                let parent_sha = spec.parent_sha.as_deref().ok_or_else(|| {
                    TaskFailure::missing_resource(format!(
                        "commit {} unreachable and no parent sha to replay from",
                        spec.commit_sha
                    ))
                })?;
                let full_name = (self.full_name_by_repo_id)(&input.raw_repo_id).ok_or_else(|| {
                    TaskFailure::fatal(format!("no full_name registered for repo {}", input.raw_repo_id))
                })?;
                effective_sha = self
                    .replay_fork_commit(&input.bare_repo_path, &full_name, &spec.commit_sha, parent_sha)
                    .await?;
                replayed = true;
            }

            let short = &effective_sha[..effective_sha.len().min(12)];
            let worktree_path = input.worktrees_root.join(short);
            if !worktree_path.exists() {
                git::checkout_worktree(&input.bare_repo_path, &effective_sha, &worktree_path)
                    .await
                    .map_err(|e| TaskFailure::retryable(format!("worktree checkout failed: {e}")))?;
            }

            outcomes.push(WorktreeOutcome {
                commit_sha: spec.commit_sha.clone(),
                effective_sha,
                worktree_path,
                replayed,
            });
        }

        Ok(serde_json::to_value(CreateWorktreesBatchOutput { outcomes })
            .expect("CreateWorktreesBatchOutput always serializes"))
    }
}

async fn apply_patch_and_write_tree(
    bare_repo_path: &Path,
    parent_sha: &str,
    patch: &str,
) -> Result<String, TaskFailure> {
    let index_file = tempfile::NamedTempFile::new()
        .map_err(|e| TaskFailure::retryable(format!("failed to create temp index: {e}")))?;

    let read_tree = Command::new("git")
        .arg("--git-dir")
        .arg(bare_repo_path)
        .env("GIT_INDEX_FILE", index_file.path())
        .args(["read-tree", parent_sha])
        .output()
        .await
        .map_err(|e| TaskFailure::retryable(format!("git read-tree spawn failed: {e}")))?;
    if !read_tree.status.success() {
        return Err(TaskFailure::missing_resource(format!(
            "git read-tree failed: {}",
            String::from_utf8_lossy(&read_tree.stderr)
        )));
    }

    let mut apply = Command::new("git")
        .arg("--git-dir")
        .arg(bare_repo_path)
        .env("GIT_INDEX_FILE", index_file.path())
        .args(["apply", "--cached", "--allow-empty", "-"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| TaskFailure::retryable(format!("git apply spawn failed: {e}")))?;

    use tokio::io::AsyncWriteExt;
    if let Some(mut stdin) = apply.stdin.take() {
        stdin
            .write_all(patch.as_bytes())
            .await
            .map_err(|e| TaskFailure::retryable(format!("failed to write patch to git apply: {e}")))?;
    }
    let apply_output = apply
        .wait_with_output()
        .await
        .map_err(|e| TaskFailure::retryable(format!("git apply failed: {e}")))?;
    if !apply_output.status.success() {
        return Err(TaskFailure::missing_resource(format!(
            "git apply rejected fork patch: {}",
            String::from_utf8_lossy(&apply_output.stderr)
        )));
    }

    let write_tree = Command::new("git")
        .arg("--git-dir")
        .arg(bare_repo_path)
        .env("GIT_INDEX_FILE", index_file.path())
        .args(["write-tree"])
        .output()
        .await
        .map_err(|e| TaskFailure::retryable(format!("git write-tree spawn failed: {e}")))?;
    if !write_tree.status.success() {
        return Err(TaskFailure::retryable(format!(
            "git write-tree failed: {}",
            String::from_utf8_lossy(&write_tree.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&write_tree.stdout).trim().to_string())
}

async fn commit_tree(
    bare_repo_path: &Path,
    tree_sha: &str,
    parent_sha: &str,
    original_commit_sha: &str,
) -> Result<String, TaskFailure> {
    let output = Command::new("git")
        .arg("--git-dir")
        .arg(bare_repo_path)
        .args(["commit-tree", tree_sha, "-p", parent_sha, "-m"])
        .arg(format!("replay of fork commit {original_commit_sha}"))
        .output()
        .await
        .map_err(|e| TaskFailure::retryable(format!("git commit-tree spawn failed: {e}")))?;
    if !output.status.success() {
        return Err(TaskFailure::retryable(format!(
            "git commit-tree failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadBuildLogsInput {
    pub full_name: String,
    pub ci_run_id: String,
    pub raw_repo_id: String,
    pub logs_root: PathBuf,
    /// Running count of consecutive expired-log builds seen so far for this
    /// repo's ingestion sweep; the caller maintains this across calls and
    /// stops dispatching further `download_build_logs` once it reaches 10.
    pub consecutive_expired: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadBuildLogsOutput {
    pub job_log_paths: Vec<PathBuf>,
    pub expired: bool,
}

/// Threshold past which the caller should stop scheduling further log
/// downloads for a repo: ten consecutive expired-log builds signal the
/// provider has rotated out everything older than its retention window.
pub const CONSECUTIVE_EXPIRED_LOG_STOP: u32 = 10;

/// Per-log-file size cap; larger files are truncated rather than rejected,
/// since partial logs still carry signal for feature extraction.
const MAX_LOG_FILE_BYTES: usize = 10 * 1024 * 1024;

pub struct DownloadBuildLogsTask {
    ci_client: Arc<dyn CiProviderClient>,
}

impl DownloadBuildLogsTask {
    pub fn new(ci_client: Arc<dyn CiProviderClient>) -> Self {
        Self { ci_client }
    }
}

#[async_trait]
impl Task for DownloadBuildLogsTask {
    async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
        let input: DownloadBuildLogsInput = serde_json::from_value(payload)
            .map_err(|e| TaskFailure::fatal(format!("invalid download_build_logs payload: {e}")))?;

        if input.consecutive_expired >= CONSECUTIVE_EXPIRED_LOG_STOP {
            return Err(TaskFailure::missing_resource(
                "consecutive expired-log threshold reached, skipping download",
            ));
        }

        let logs = match self.ci_client.fetch_build_logs(&input.full_name, &input.ci_run_id).await {
            Ok(logs) => logs,
            Err(ProviderError::NotFound(_)) => {
                return Ok(serde_json::to_value(DownloadBuildLogsOutput {
                    job_log_paths: Vec::new(),
                    expired: true,
                })
                .expect("DownloadBuildLogsOutput always serializes"));
            }
            Err(e) => return Err(map_provider_error(e)),
        };

        let run_dir = input.logs_root.join(&input.raw_repo_id).join(&input.ci_run_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| TaskFailure::retryable(format!("failed to create log dir: {e}")))?;

        let mut job_log_paths = Vec::with_capacity(logs.len());
        for (job_name, content) in logs {
            let path = run_dir.join(format!("{job_name}.log"));
            if path.exists() {
                job_log_paths.push(path);
                continue;
            }
            let truncated: String = content.chars().take(MAX_LOG_FILE_BYTES).collect();
            tokio::fs::write(&path, truncated)
                .await
                .map_err(|e| TaskFailure::retryable(format!("failed to write log file: {e}")))?;
            job_log_paths.push(path);
        }

        Ok(serde_json::to_value(DownloadBuildLogsOutput { job_log_paths, expired: false })
            .expect("DownloadBuildLogsOutput always serializes"))
    }
}

/// One build's resource-acquisition spec within a repo-wide ingestion
/// dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIngestionBuildSpec {
    pub ingestion_build_id: String,
    pub commit_sha: String,
    pub parent_sha: Option<String>,
    pub ci_run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIngestionInput {
    pub raw_repo_id: String,
    pub full_name: String,
    pub clone_url: String,
    pub repos_root: PathBuf,
    pub worktrees_root: PathBuf,
    pub logs_root: PathBuf,
    pub builds: Vec<RepoIngestionBuildSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceResult {
    pub status: ResourceResultStatus,
    pub error: Option<String>,
    pub expected_loss: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceResultStatus {
    Completed,
    Failed,
}

impl ResourceResult {
    fn ok() -> Self {
        Self { status: ResourceResultStatus::Completed, error: None, expected_loss: false }
    }
    fn failed(message: impl Into<String>, expected_loss: bool) -> Self {
        Self { status: ResourceResultStatus::Failed, error: Some(message.into()), expected_loss }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIngestionBuildResult {
    pub ingestion_build_id: String,
    pub git_worktree: ResourceResult,
    pub build_logs: ResourceResult,
    pub effective_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoIngestionOutput {
    pub results: Vec<RepoIngestionBuildResult>,
}

/// One repository's whole ingestion dispatch: clone, then worktree checkout
/// for every distinct commit, then log download per build. A clone failure
/// fails the whole task (every build in this repo becomes a missing
/// resource, per `IngestionBuild::mark_missing_resource`); a worktree-batch
/// failure likewise, since a single irreplayable fork commit means the
/// batch aborted partway through `git` subprocess calls. Log downloads are
/// per-build and never abort the repo dispatch — a missing log is an
/// expected loss, not a repo-wide failure.
pub struct RepoIngestionTask {
    clone: Arc<CloneRepoTask>,
    worktrees: Arc<CreateWorktreesBatchTask>,
    logs: Arc<DownloadBuildLogsTask>,
}

impl RepoIngestionTask {
    pub fn new(
        clone: Arc<CloneRepoTask>,
        worktrees: Arc<CreateWorktreesBatchTask>,
        logs: Arc<DownloadBuildLogsTask>,
    ) -> Self {
        Self { clone, worktrees, logs }
    }
}

#[async_trait]
impl Task for RepoIngestionTask {
    async fn run(&self, ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
        let input: RepoIngestionInput = serde_json::from_value(payload)
            .map_err(|e| TaskFailure::fatal(format!("invalid repo_ingestion payload: {e}")))?;

        let clone_input = CloneRepoInput {
            raw_repo_id: input.raw_repo_id.clone(),
            clone_url: input.clone_url.clone(),
            repos_root: input.repos_root.clone(),
        };
        let clone_output: CloneRepoOutput = serde_json::from_value(
            self.clone.run(ctx, serde_json::to_value(clone_input).expect("serializes")).await?,
        )
        .map_err(|e| TaskFailure::fatal(format!("malformed clone_repo output: {e}")))?;

        let worktree_input = CreateWorktreesBatchInput {
            raw_repo_id: input.raw_repo_id.clone(),
            bare_repo_path: clone_output.bare_repo_path,
            worktrees_root: input.worktrees_root.clone(),
            specs: input
                .builds
                .iter()
                .map(|b| WorktreeSpec { commit_sha: b.commit_sha.clone(), parent_sha: b.parent_sha.clone() })
                .collect(),
        };
        let worktree_output: CreateWorktreesBatchOutput = serde_json::from_value(
            self.worktrees.run(ctx, serde_json::to_value(worktree_input).expect("serializes")).await?,
        )
        .map_err(|e| TaskFailure::fatal(format!("malformed create_worktrees_batch output: {e}")))?;

        let effective_sha_by_commit: std::collections::HashMap<String, String> = worktree_output
            .outcomes
            .iter()
            .map(|o| (o.commit_sha.clone(), o.effective_sha.clone()))
            .collect();

        let mut results = Vec::with_capacity(input.builds.len());
        let mut consecutive_expired = 0u32;
        for build in &input.builds {
            let logs_input = DownloadBuildLogsInput {
                full_name: input.full_name.clone(),
                ci_run_id: build.ci_run_id.clone(),
                raw_repo_id: input.raw_repo_id.clone(),
                logs_root: input.logs_root.clone(),
                consecutive_expired,
            };
            let build_logs = match self.logs.run(ctx, serde_json::to_value(logs_input).expect("serializes")).await {
                Ok(value) => {
                    let output: DownloadBuildLogsOutput =
                        serde_json::from_value(value).map_err(|e| TaskFailure::fatal(e.to_string()))?;
                    if output.expired {
                        consecutive_expired += 1;
                        ResourceResult::failed("logs expired", true)
                    } else {
                        consecutive_expired = 0;
                        ResourceResult::ok()
                    }
                }
                Err(failure) if failure.kind == buildrisk_core::runtime::FailureKind::MissingResource => {
                    consecutive_expired += 1;
                    ResourceResult::failed(failure.message, true)
                }
                Err(failure) => ResourceResult::failed(failure.message, false),
            };

            results.push(RepoIngestionBuildResult {
                ingestion_build_id: build.ingestion_build_id.clone(),
                git_worktree: ResourceResult::ok(),
                build_logs,
                effective_sha: effective_sha_by_commit.get(&build.commit_sha).cloned(),
            });
        }

        Ok(serde_json::to_value(RepoIngestionOutput { results }).expect("RepoIngestionOutput always serializes"))
    }
}

fn map_provider_error(err: ProviderError) -> TaskFailure {
    match err {
        ProviderError::Retryable(m) => TaskFailure::retryable(m),
        ProviderError::RateLimited { message, .. } => TaskFailure::rate_limited(message),
        ProviderError::Auth(m) => TaskFailure::fatal(m),
        ProviderError::NotFound(m) => TaskFailure::missing_resource(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildrisk_core::runtime::TaskContext;
    use std::collections::HashMap;

    #[tokio::test]
    async fn clone_repo_reuses_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let repos_root = tmp.path().join("repos");
        let bare_path = repos_root.join("repo-1");
        tokio::fs::create_dir_all(&bare_path).await.unwrap();

        let task = CloneRepoTask::new(Arc::new(RepoLockRegistry::new()));
        let input = CloneRepoInput {
            raw_repo_id: "repo-1".to_string(),
            clone_url: "https://example.invalid/org/repo.git".to_string(),
            repos_root,
        };
        let output: CloneRepoOutput = serde_json::from_value(
            task.run(&TaskContext::new(), serde_json::to_value(input).unwrap()).await.unwrap(),
        )
        .unwrap();
        assert_eq!(output.bare_repo_path, bare_path);
    }

    #[tokio::test]
    async fn download_build_logs_stops_at_threshold() {
        let ci_client: Arc<dyn CiProviderClient> = Arc::new(crate::provider::FakeCiProviderClient::new());
        let task = DownloadBuildLogsTask::new(ci_client);
        let input = DownloadBuildLogsInput {
            full_name: "org/repo".to_string(),
            ci_run_id: "1".to_string(),
            raw_repo_id: "repo-1".to_string(),
            logs_root: std::env::temp_dir(),
            consecutive_expired: CONSECUTIVE_EXPIRED_LOG_STOP,
        };
        let err = task.run(&TaskContext::new(), serde_json::to_value(input).unwrap()).await.unwrap_err();
        assert_eq!(err.kind, buildrisk_core::runtime::FailureKind::MissingResource);
    }

    #[tokio::test]
    async fn download_build_logs_missing_run_reports_expired() {
        let ci_client: Arc<dyn CiProviderClient> = Arc::new(crate::provider::FakeCiProviderClient::new());
        let task = DownloadBuildLogsTask::new(ci_client);
        let input = DownloadBuildLogsInput {
            full_name: "org/repo".to_string(),
            ci_run_id: "missing".to_string(),
            raw_repo_id: "repo-1".to_string(),
            logs_root: std::env::temp_dir(),
            consecutive_expired: 0,
        };
        let output: DownloadBuildLogsOutput = serde_json::from_value(
            task.run(&TaskContext::new(), serde_json::to_value(input).unwrap()).await.unwrap(),
        )
        .unwrap();
        assert!(output.expired);
        assert!(output.job_log_paths.is_empty());
    }

    #[tokio::test]
    async fn download_build_logs_writes_seeded_logs_to_disk() {
        let ci_client = Arc::new(crate::provider::FakeCiProviderClient::new());
        let mut logs = HashMap::new();
        logs.insert("build".to_string(), "line one\nline two".to_string());
        ci_client.seed_logs("org/repo", "run-1", logs).await;

        let tmp = tempfile::tempdir().unwrap();
        let task = DownloadBuildLogsTask::new(ci_client);
        let input = DownloadBuildLogsInput {
            full_name: "org/repo".to_string(),
            ci_run_id: "run-1".to_string(),
            raw_repo_id: "repo-1".to_string(),
            logs_root: tmp.path().to_path_buf(),
            consecutive_expired: 0,
        };
        let output: DownloadBuildLogsOutput = serde_json::from_value(
            task.run(&TaskContext::new(), serde_json::to_value(input).unwrap()).await.unwrap(),
        )
        .unwrap();
        assert!(!output.expired);
        assert_eq!(output.job_log_paths.len(), 1);
        assert!(output.job_log_paths[0].exists());
    }
}
