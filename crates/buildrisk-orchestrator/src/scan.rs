//! Scan Dispatcher (C7): groups ingested builds by `(raw_repo_id, commit_sha)`,
//! dispatches one scan per enabled tool per unique commit, and backfills scan
//! metrics into every `FeatureVector` sharing that commit.
//!
//! Sonar is webhook-driven: `start_sonar_scan` only submits the analysis and
//! marks the tracking row `awaiting_webhook`; the server-side analysis result
//! arrives later through `on_sonar_analysis_complete`. Trivy runs
//! synchronously and backfills on return.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildrisk_core::domain::{FeatureValue, FeatureVector};
use buildrisk_state::StorageResult;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use buildrisk_core::domain::scan_tracking::{component_key, ScanTool, SonarScanPending, TrivyCommitScan};
use crate::store::Repo;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("scan failed transiently: {0}")]
    Retryable(String),
    #[error("scan failed: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawScanOutput {
    pub metrics: HashMap<String, f64>,
}

/// The pinned boundary to a scanner binary/server; scanner internals are out
/// of scope, this crate only needs the metric snapshot (or, for Sonar, the
/// acknowledgement that analysis was submitted).
#[async_trait]
pub trait ScannerClient: Send + Sync {
    async fn run_scan(&self, worktree: &Path, config: &Path) -> Result<RawScanOutput, ScanError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ScanBatchConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
}

impl Default for ScanBatchConfig {
    fn default() -> Self {
        Self { batch_size: 100, inter_batch_delay: Duration::from_millis(500) }
    }
}

/// One unique `(raw_repo_id, commit_sha)` to scan, carrying everything the
/// dispatcher needs to run every enabled tool against it. `feature_vector_ids`
/// is resolved by the caller (the orchestrator, which owns the
/// commit-sha-to-build join) rather than re-derived here.
#[derive(Debug, Clone)]
pub struct ScanUnit {
    pub raw_repo_id: Uuid,
    pub github_repo_id: String,
    pub full_name: String,
    pub commit_sha: String,
    pub worktree_path: PathBuf,
    pub feature_vector_ids: Vec<Uuid>,
}

pub fn dedupe_scan_units(units: Vec<ScanUnit>) -> Vec<ScanUnit> {
    let mut seen = HashSet::new();
    units
        .into_iter()
        .filter(|u| seen.insert((u.raw_repo_id, u.commit_sha.clone())))
        .collect()
}

#[derive(Debug, Default, Clone)]
pub struct ScanBatchOutcome {
    pub sonar_submitted: usize,
    pub sonar_failed: usize,
    pub trivy_completed: usize,
    pub trivy_failed: usize,
}

impl ScanBatchOutcome {
    fn merge(&mut self, other: ScanBatchOutcome) {
        self.sonar_submitted += other.sonar_submitted;
        self.sonar_failed += other.sonar_failed;
        self.trivy_completed += other.trivy_completed;
        self.trivy_failed += other.trivy_failed;
    }

    pub fn completed(&self) -> usize {
        self.sonar_submitted + self.trivy_completed
    }

    pub fn failed(&self) -> usize {
        self.sonar_failed + self.trivy_failed
    }
}

pub struct ScanDispatcher {
    sonar_client: Arc<dyn ScannerClient>,
    trivy_client: Arc<dyn ScannerClient>,
    feature_vectors: Arc<Repo<FeatureVector>>,
    sonar_pending: Arc<Repo<SonarScanPending>>,
    trivy_scans: Arc<Repo<TrivyCommitScan>>,
    scan_config_root: PathBuf,
    batch_config: ScanBatchConfig,
    /// component_key -> (scenario_id, pending_row_id), so the webhook
    /// handler can resolve a row knowing only the component key Sonar hands
    /// back. Populated at dispatch time; this process is the only writer of
    /// Sonar pending rows, so an in-memory index is sufficient.
    component_index: Mutex<HashMap<String, (Uuid, Uuid)>>,
}

impl ScanDispatcher {
    pub fn new(
        sonar_client: Arc<dyn ScannerClient>,
        trivy_client: Arc<dyn ScannerClient>,
        feature_vectors: Arc<Repo<FeatureVector>>,
        sonar_pending: Arc<Repo<SonarScanPending>>,
        trivy_scans: Arc<Repo<TrivyCommitScan>>,
        scan_config_root: PathBuf,
        batch_config: ScanBatchConfig,
    ) -> Self {
        Self {
            sonar_client,
            trivy_client,
            feature_vectors,
            sonar_pending,
            trivy_scans,
            scan_config_root,
            batch_config,
            component_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn config_path(&self, scenario_id: Uuid, github_repo_id: &str, tool: ScanTool) -> PathBuf {
        let file_name = match tool {
            ScanTool::Sonarqube => "sonar-project.properties",
            ScanTool::Trivy => "trivy.yaml",
        };
        self.scan_config_root.join(scenario_id.to_string()).join(github_repo_id).join(file_name)
    }

    /// Write a tool's config to its deterministic path, once. Existing files
    /// are left untouched (write-once, like the log directory).
    async fn materialize_config(&self, path: &Path, contents: &str) -> StorageResult<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| buildrisk_state::StorageError::Backend(e.to_string()))?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| buildrisk_state::StorageError::Backend(e.to_string()))
    }

    /// Dispatch every enabled tool against every unique commit in `units`,
    /// in batches of `batch_config.batch_size` with a delay between batches.
    pub async fn dispatch_all(
        &self,
        scenario_id: Uuid,
        units: Vec<ScanUnit>,
        scan_sonar: bool,
        scan_trivy: bool,
        tool_configs: &HashMap<Uuid, (String, String)>,
    ) -> ScanBatchOutcome {
        let units = dedupe_scan_units(units);
        let mut outcome = ScanBatchOutcome::default();

        for (i, batch) in units.chunks(self.batch_config.batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.batch_config.inter_batch_delay).await;
            }
            let mut futures = Vec::new();
            for unit in batch {
                let (trivy_cfg, sonar_cfg) = tool_configs
                    .get(&unit.raw_repo_id)
                    .cloned()
                    .unwrap_or_default();
                if scan_trivy {
                    futures.push(self.dispatch_trivy(scenario_id, unit, &trivy_cfg));
                }
                if scan_sonar {
                    futures.push(self.dispatch_sonar(scenario_id, unit, &sonar_cfg));
                }
            }
            for result in futures::future::join_all(futures).await {
                outcome.merge(result);
            }
        }
        outcome
    }

    fn dispatch_trivy<'a>(
        &'a self,
        scenario_id: Uuid,
        unit: &'a ScanUnit,
        config_contents: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ScanBatchOutcome> + Send + 'a>> {
        Box::pin(async move {
            let mut outcome = ScanBatchOutcome::default();
            let config_path = self.config_path(scenario_id, &unit.github_repo_id, ScanTool::Trivy);
            if let Err(e) = self.materialize_config(&config_path, config_contents).await {
                tracing::warn!(%e, commit = %unit.commit_sha, "failed to materialize trivy config");
            }

            let mut scan = TrivyCommitScan::new(scenario_id, unit.raw_repo_id, unit.commit_sha.clone());
            let scan_id = scan.id;

            match self.trivy_client.run_scan(&unit.worktree_path, &config_path).await {
                Ok(raw) => {
                    let now = chrono::Utc::now();
                    let metrics = raw.metrics.iter().map(|(k, v)| (k.clone(), *v)).collect::<serde_json::Map<_, _>>();
                    scan.complete(serde_json::Value::Object(
                        metrics.into_iter().map(|(k, v)| (k, serde_json::json!(v))).collect(),
                    ), now);
                    if let Err(e) = self.trivy_scans.upsert(scan_id, scenario_id, &scan).await {
                        tracing::warn!(%e, "failed to persist trivy scan row");
                    }
                    if let Err(e) = self.backfill_metrics(&unit.feature_vector_ids, scenario_id, "trivy", &raw.metrics).await {
                        tracing::warn!(%e, "failed to backfill trivy metrics");
                    }
                    outcome.trivy_completed += 1;
                }
                Err(e) => {
                    tracing::warn!(%e, commit = %unit.commit_sha, "trivy scan failed");
                    scan.fail(chrono::Utc::now());
                    if let Err(e) = self.trivy_scans.upsert(scan_id, scenario_id, &scan).await {
                        tracing::warn!(%e, "failed to persist failed trivy scan row");
                    }
                    outcome.trivy_failed += 1;
                }
            }
            outcome
        })
    }

    fn dispatch_sonar<'a>(
        &'a self,
        scenario_id: Uuid,
        unit: &'a ScanUnit,
        config_contents: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ScanBatchOutcome> + Send + 'a>> {
        Box::pin(async move {
            let mut outcome = ScanBatchOutcome::default();
            let config_path = self.config_path(scenario_id, &unit.github_repo_id, ScanTool::Sonarqube);
            if let Err(e) = self.materialize_config(&config_path, config_contents).await {
                tracing::warn!(%e, commit = %unit.commit_sha, "failed to materialize sonar config");
            }

            let key = component_key(&scenario_prefix(scenario_id), &unit.full_name, &unit.commit_sha);
            let mut pending = SonarScanPending::new(scenario_id, unit.raw_repo_id, unit.commit_sha.clone(), key.clone());
            let pending_id = pending.id;

            match self.sonar_client.run_scan(&unit.worktree_path, &config_path).await {
                Ok(_ack) => {
                    pending.mark_awaiting_webhook();
                    if let Err(e) = self.sonar_pending.upsert(pending_id, scenario_id, &pending).await {
                        tracing::warn!(%e, "failed to persist sonar pending row");
                    }
                    self.component_index.lock().await.insert(key, (scenario_id, pending_id));
                    outcome.sonar_submitted += 1;
                }
                Err(e) => {
                    tracing::warn!(%e, commit = %unit.commit_sha, "sonar submission failed");
                    pending.fail(chrono::Utc::now());
                    if let Err(e) = self.sonar_pending.upsert(pending_id, scenario_id, &pending).await {
                        tracing::warn!(%e, "failed to persist failed sonar pending row");
                    }
                    outcome.sonar_failed += 1;
                }
            }
            outcome
        })
    }

    /// Webhook entry point: Sonar's server-side analysis completed for
    /// `component_key`. Looks the pending row up by the in-memory index,
    /// marks it complete, and backfills its feature vectors.
    pub async fn on_sonar_analysis_complete(
        &self,
        component_key: &str,
        feature_vector_ids: &[Uuid],
        metrics: HashMap<String, f64>,
    ) -> Result<(), ScanError> {
        let (scenario_id, pending_id) = self
            .component_index
            .lock()
            .await
            .get(component_key)
            .copied()
            .ok_or_else(|| ScanError::Fatal(format!("unknown sonar component key: {component_key}")))?;

        let mut pending = self
            .sonar_pending
            .get(pending_id)
            .await
            .map_err(|e| ScanError::Retryable(e.to_string()))?
            .ok_or_else(|| ScanError::Fatal(format!("sonar pending row {pending_id} missing")))?;
        pending.complete(chrono::Utc::now());
        self.sonar_pending
            .upsert(pending_id, scenario_id, &pending)
            .await
            .map_err(|e| ScanError::Retryable(e.to_string()))?;

        self.backfill_metrics(feature_vector_ids, scenario_id, "sonar", &metrics)
            .await
            .map_err(|e| ScanError::Retryable(e.to_string()))
    }

    /// `RetryCommitScan`: resets the tracking row and redispatches a single
    /// tool against a single commit.
    pub async fn retry_commit_scan(
        &self,
        scenario_id: Uuid,
        unit: &ScanUnit,
        tool: ScanTool,
        config_contents: &str,
    ) -> ScanBatchOutcome {
        match tool {
            ScanTool::Trivy => self.dispatch_trivy(scenario_id, unit, config_contents).await,
            ScanTool::Sonarqube => self.dispatch_sonar(scenario_id, unit, config_contents).await,
        }
    }

    async fn backfill_metrics(
        &self,
        feature_vector_ids: &[Uuid],
        _scenario_id: Uuid,
        prefix: &str,
        metrics: &HashMap<String, f64>,
    ) -> StorageResult<()> {
        for &id in feature_vector_ids {
            let Some(mut vector) = self.feature_vectors.get(id).await? else { continue };
            for (name, value) in metrics {
                vector.set_scan_metric(format!("{prefix}_{name}"), FeatureValue::Number(*value));
            }
            vector.updated_at = chrono::Utc::now();
            self.feature_vectors.upsert(id, vector.scope_id, &vector).await?;
        }
        Ok(())
    }
}

fn scenario_prefix(scenario_id: Uuid) -> String {
    scenario_id.simple().to_string()[..8].to_string()
}

/// In-memory scanner double, keyed by worktree path, for tests.
#[derive(Default)]
pub struct FakeScannerClient {
    pub results: Mutex<HashMap<PathBuf, RawScanOutput>>,
    pub failures: Mutex<HashSet<PathBuf>>,
}

impl FakeScannerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, worktree: impl Into<PathBuf>, metrics: HashMap<String, f64>) {
        self.results.lock().await.insert(worktree.into(), RawScanOutput { metrics });
    }

    pub async fn seed_failure(&self, worktree: impl Into<PathBuf>) {
        self.failures.lock().await.insert(worktree.into());
    }
}

#[async_trait]
impl ScannerClient for FakeScannerClient {
    async fn run_scan(&self, worktree: &Path, _config: &Path) -> Result<RawScanOutput, ScanError> {
        if self.failures.lock().await.contains(worktree) {
            return Err(ScanError::Retryable(format!("seeded failure for {}", worktree.display())));
        }
        Ok(self.results.lock().await.get(worktree).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildrisk_state::fakes::InMemoryEntityStore;

    fn unit(repo: Uuid, sha: &str, vector_id: Uuid) -> ScanUnit {
        ScanUnit {
            raw_repo_id: repo,
            github_repo_id: "123".to_string(),
            full_name: "org/repo".to_string(),
            commit_sha: sha.to_string(),
            worktree_path: PathBuf::from(format!("/tmp/worktrees/{sha}")),
            feature_vector_ids: vec![vector_id],
        }
    }

    fn dispatcher(sonar: Arc<FakeScannerClient>, trivy: Arc<FakeScannerClient>) -> (ScanDispatcher, Arc<Repo<FeatureVector>>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let feature_vectors = Arc::new(Repo::new(store.clone(), "feature_vector"));
        let sonar_pending = Arc::new(Repo::new(store.clone(), "sonar_scan_pending"));
        let trivy_scans = Arc::new(Repo::new(store, "trivy_commit_scan"));
        let dispatcher = ScanDispatcher::new(
            sonar,
            trivy,
            feature_vectors.clone(),
            sonar_pending,
            trivy_scans,
            std::env::temp_dir().join("scan-config-test"),
            ScanBatchConfig { batch_size: 2, inter_batch_delay: Duration::from_millis(1) },
        );
        (dispatcher, feature_vectors)
    }

    #[tokio::test]
    async fn trivy_scan_backfills_feature_vector_with_prefixed_keys() {
        let trivy = Arc::new(FakeScannerClient::new());
        let mut metrics = HashMap::new();
        metrics.insert("critical_count".to_string(), 3.0);
        trivy.seed("/tmp/worktrees/abc", metrics).await;

        let (dispatcher, feature_vectors) = dispatcher(Arc::new(FakeScannerClient::new()), trivy);
        let scenario_id = Uuid::new_v4();
        let repo_id = Uuid::new_v4();
        let vector = FeatureVector::new(scenario_id, repo_id, Uuid::new_v4());
        let vector_id = vector.id;
        feature_vectors.upsert(vector_id, scenario_id, &vector).await.unwrap();

        let unit = unit(repo_id, "abc", vector_id);
        let outcome = dispatcher.dispatch_all(scenario_id, vec![unit], false, true, &HashMap::new()).await;

        assert_eq!(outcome.trivy_completed, 1);
        let updated = feature_vectors.get(vector_id).await.unwrap().unwrap();
        assert_eq!(updated.scan_metrics.get("trivy_critical_count").and_then(|v| v.as_f64()), Some(3.0));
    }

    #[tokio::test]
    async fn sonar_submission_marks_awaiting_webhook_not_completed() {
        let sonar = Arc::new(FakeScannerClient::new());
        sonar.seed("/tmp/worktrees/def", HashMap::new()).await;
        let (dispatcher, _vectors) = dispatcher(sonar, Arc::new(FakeScannerClient::new()));
        let scenario_id = Uuid::new_v4();
        let repo_id = Uuid::new_v4();
        let unit = unit(repo_id, "def", Uuid::new_v4());
        let outcome = dispatcher.dispatch_all(scenario_id, vec![unit], true, false, &HashMap::new()).await;
        assert_eq!(outcome.sonar_submitted, 1);
        assert_eq!(outcome.completed(), 1);
    }

    #[tokio::test]
    async fn dedupe_scan_units_collapses_repeated_commit() {
        let repo_id = Uuid::new_v4();
        let units = vec![unit(repo_id, "abc", Uuid::new_v4()), unit(repo_id, "abc", Uuid::new_v4())];
        assert_eq!(dedupe_scan_units(units).len(), 1);
    }
}
