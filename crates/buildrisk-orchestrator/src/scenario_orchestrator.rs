//! Scenario Orchestrator (C4) — composes the Task Runtime, Graph Composer,
//! Resource DAG, Feature DAG Engine, Ingestion Workers and Scan Dispatcher
//! into the four-phase scenario generation pipeline: Filter, Ingest,
//! Process, Split.
//!
//! `start_scenario_generation` drives Filter + Ingest and persists a
//! `RunPointer` so `start_processing` can resume the same `PipelineRun`
//! (and therefore the same correlation id) for Process + Split. The two
//! are split into separate entry points because ingestion and processing
//! are dispatched independently in practice: an operator inspects ingestion
//! results (and retries missing resources) before kicking off the
//! feature-extraction phase.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use buildrisk_core::domain::digest::compute_digest;
use buildrisk_core::domain::scan_tracking::ScanTool;
use buildrisk_core::domain::{
    BuildConclusion, DataSourceConfig, DatasetSplit, EnrichmentBuild, FeatureAuditLog,
    FeatureVector, FilterMode, IngestionBuild, NodeExecutionRecord, NodeOutcome, OutputFormat,
    Phase, PipelineRun, RawBuildRun, RawRepository, ResourceName, ResourceStatus, SplitAssignment,
};
use buildrisk_core::feature_dag::{NodeRunOutcome, ResourceHandle, ResourceRequirement};
use buildrisk_core::splitting::export::{export, md5_checksum_of};
use buildrisk_core::{
    apply_preprocessing, emit_node_executed, execute_feature_dag, feature_extraction_chain,
    ingestion_chord, load_run, resolve_feature_dag, resolve_resource_dag, split_dataset,
    summarize_feature_dag, DatasetRow, DomainError, PipelineRunRecorder, Result as CoreResult,
    Runtime, Scenario, ScenarioStatus, SplitResult, Task, TaskContext, TaskFailure,
};
use buildrisk_state::{PipelineRunLedger, StorageError, GLOBAL_SCOPE};

use crate::events::{EventBus, EventEnvelope, EventTopic};
use crate::provider::CiProviderClient;
use crate::scan::{ScanDispatcher, ScanUnit};
use crate::store::Repo;
use crate::tasks::{
    RepoIngestionBuildSpec, RepoIngestionInput, RepoIngestionOutput, RepoIngestionTask,
    ResourceResultStatus,
};

fn storage_err(err: StorageError) -> DomainError {
    DomainError::Storage(err.to_string())
}

fn default_clone_url(full_name: &str) -> String {
    format!("https://github.com/{full_name}.git")
}

/// Maps a Feature DAG resource dependency onto the coarser Resource DAG
/// vocabulary the Ingestion Workers actually acquire. `GithubClient` and
/// `WorkflowRun` need no acquisition step of their own: the former is a
/// capability marker, the latter is already populated at ingestion time
/// from `RawBuildRun.jobs_metadata`.
fn resource_requirement_to_name(requirement: ResourceRequirement) -> Option<ResourceName> {
    match requirement {
        ResourceRequirement::GitHistory => Some(ResourceName::GitHistory),
        ResourceRequirement::GitWorktree => Some(ResourceName::GitWorktree),
        ResourceRequirement::BuildLogs => Some(ResourceName::BuildLogs),
        ResourceRequirement::GithubClient | ResourceRequirement::WorkflowRun => None,
    }
}

fn map_node_outcome(outcome: &NodeRunOutcome) -> (NodeOutcome, Option<String>, Option<String>) {
    match outcome {
        NodeRunOutcome::Succeeded => (NodeOutcome::Succeeded, None, None),
        NodeRunOutcome::Skipped(reason) => (NodeOutcome::Skipped, None, Some(reason.clone())),
        NodeRunOutcome::Failed(error) => (NodeOutcome::Failed, Some(error.clone()), None),
    }
}

fn filter_matches(cfg: &DataSourceConfig, repo: &RawRepository, build: &RawBuildRun) -> bool {
    if cfg.ci_provider != "all" && !cfg.ci_provider.eq_ignore_ascii_case(&build.provider) {
        return false;
    }
    if cfg.exclude_bots && build.is_bot_commit {
        return false;
    }
    if let Some(start) = cfg.date_start {
        match build.started_at {
            Some(started_at) if started_at >= start => {}
            _ => return false,
        }
    }
    if let Some(end) = cfg.date_end {
        match build.started_at {
            Some(started_at) if started_at <= end => {}
            _ => return false,
        }
    }
    if !cfg.conclusions.is_empty() {
        let label = match build.conclusion {
            Some(conclusion) => format!("{conclusion:?}").to_lowercase(),
            None => return false,
        };
        if !cfg.conclusions.iter().any(|c| c.eq_ignore_ascii_case(&label)) {
            return false;
        }
    }
    match cfg.filter_mode {
        FilterMode::All => true,
        FilterMode::ByLanguage => repo
            .primary_language
            .as_deref()
            .map(|language| cfg.languages.iter().any(|l| l.eq_ignore_ascii_case(language)))
            .unwrap_or(false),
        FilterMode::ByName => cfg.names.iter().any(|name| name == &repo.full_name),
        FilterMode::ByOwner => repo
            .full_name
            .split('/')
            .next()
            .map(|owner| cfg.owners.iter().any(|o| o == owner))
            .unwrap_or(false),
    }
}

/// Scenario-level sub-configuration for the scan config files the Scan
/// Dispatcher writes to disk once per repo. The scenario stores a single
/// raw config blob (`FeaturesConfig::scan_config`); every repo in the
/// scenario is scanned with the same tool configuration.
fn scan_config_contents(scan_config: &Value) -> (String, String) {
    let trivy = scan_config
        .get("trivy")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let sonar = scan_config
        .get("sonarqube")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (trivy, sonar)
}

/// Bridges the two public entry points (`start_scenario_generation` and
/// `start_processing`) that share one `PipelineRun`/correlation id.
/// `PipelineRun::new` generates its correlation id internally, so the only
/// way `start_processing` can find the run Phase 1-2 created is to look
/// this up first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPointer {
    pub correlation_id: Uuid,
}

const RUN_POINTER_KIND: &str = "pipeline_run_pointer";

pub fn run_pointer_kind() -> &'static str {
    RUN_POINTER_KIND
}

/// Chained payload for `ProcessBuildTask`. `feature_extraction_chain` only
/// ever feeds the first `build_args` entry in as the chain's initial
/// payload; every later stage receives the *previous* stage's output. So
/// the list of enrichment builds still to process has to travel inside
/// this payload itself, one id popped off per chain stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessChainPayload {
    remaining_ids: Vec<Uuid>,
    scenario_id: Uuid,
    correlation_id: Uuid,
    config_digest: String,
    dag_features: Vec<String>,
}

/// One Feature DAG extraction attempt for a single `EnrichmentBuild`.
/// Chained by `Runtime::chain` via `graph::feature_extraction_chain`, one
/// stage per remaining build, so builds within a scenario run are
/// extracted in sequence (history-dependent features need to observe a
/// consistent ordering of prior builds).
struct ProcessBuildTask {
    enrichment_builds: Arc<Repo<EnrichmentBuild>>,
    ingestion_builds: Arc<Repo<IngestionBuild>>,
    raw_build_runs: Arc<Repo<RawBuildRun>>,
    raw_repositories: Arc<Repo<RawRepository>>,
    feature_vectors: Arc<Repo<FeatureVector>>,
    ledger: Arc<dyn PipelineRunLedger>,
    repos_root: PathBuf,
    worktrees_root: PathBuf,
    logs_root: PathBuf,
}

impl ProcessBuildTask {
    fn resources_for(
        &self,
        ingestion_build: &IngestionBuild,
        build: &RawBuildRun,
    ) -> HashMap<ResourceRequirement, ResourceHandle> {
        let mut resources = HashMap::new();
        resources.insert(ResourceRequirement::GithubClient, ResourceHandle::GithubClient);
        resources.insert(
            ResourceRequirement::WorkflowRun,
            ResourceHandle::WorkflowRun {
                payload: build.jobs_metadata.clone(),
            },
        );

        let completed = |name: ResourceName| {
            ingestion_build
                .resource_status
                .get(&name)
                .map(|entry| entry.status == ResourceStatus::Completed)
                .unwrap_or(false)
        };

        if completed(ResourceName::GitHistory) {
            resources.insert(
                ResourceRequirement::GitHistory,
                ResourceHandle::GitHistory {
                    bare_repo_path: self
                        .repos_root
                        .join(ingestion_build.raw_repo_id.to_string())
                        .to_string_lossy()
                        .into_owned(),
                },
            );
        }
        if completed(ResourceName::GitWorktree) {
            resources.insert(
                ResourceRequirement::GitWorktree,
                ResourceHandle::GitWorktree {
                    path: self
                        .worktrees_root
                        .join(build.short_sha())
                        .to_string_lossy()
                        .into_owned(),
                    effective_sha: build.effective_sha.clone(),
                    is_commit_available: true,
                },
            );
        }
        if completed(ResourceName::BuildLogs) {
            let run_dir = self
                .logs_root
                .join(ingestion_build.raw_repo_id.to_string())
                .join(&ingestion_build.ci_run_id);
            let mut raw_text = String::new();
            if let Ok(entries) = std::fs::read_dir(&run_dir) {
                for entry in entries.flatten() {
                    if let Ok(contents) = std::fs::read_to_string(entry.path()) {
                        raw_text.push_str(&contents);
                        raw_text.push('\n');
                    }
                }
            }
            resources.insert(ResourceRequirement::BuildLogs, ResourceHandle::BuildLogs { raw_text });
        }
        resources
    }
}

#[async_trait]
impl Task for ProcessBuildTask {
    async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
        let mut chain: ProcessChainPayload = serde_json::from_value(payload)
            .map_err(|e| TaskFailure::fatal(format!("invalid process chain payload: {e}")))?;

        let Some(enrichment_build_id) = chain.remaining_ids.first().copied() else {
            return serde_json::to_value(&chain)
                .map_err(|e| TaskFailure::fatal(e.to_string()));
        };
        chain.remaining_ids.remove(0);

        let Some(mut enrichment_build) = self
            .enrichment_builds
            .get(enrichment_build_id)
            .await
            .map_err(|e| TaskFailure::fatal(e.to_string()))?
        else {
            return serde_json::to_value(&chain).map_err(|e| TaskFailure::fatal(e.to_string()));
        };

        let ingestion_build = self
            .ingestion_builds
            .get(enrichment_build.ingestion_build_id)
            .await
            .map_err(|e| TaskFailure::fatal(e.to_string()))?;
        let build = self
            .raw_build_runs
            .get(enrichment_build.raw_build_run_id)
            .await
            .map_err(|e| TaskFailure::fatal(e.to_string()))?;
        let repo = self
            .raw_repositories
            .get(enrichment_build.raw_repo_id)
            .await
            .map_err(|e| TaskFailure::fatal(e.to_string()))?;

        let (Some(ingestion_build), Some(build), Some(repo)) = (ingestion_build, build, repo)
        else {
            enrichment_build.fail("missing ingestion/build/repository record", Utc::now());
            self.enrichment_builds
                .upsert(enrichment_build.id, chain.scenario_id, &enrichment_build)
                .await
                .map_err(|e| TaskFailure::fatal(e.to_string()))?;
            return serde_json::to_value(&chain).map_err(|e| TaskFailure::fatal(e.to_string()));
        };

        let resources = self.resources_for(&ingestion_build, &build);
        let plan = resolve_feature_dag(&chain.dag_features)
            .map_err(|e| TaskFailure::fatal(format!("feature dag cycle: {e:?}")))?;
        let (features, outcomes) = execute_feature_dag(&plan, &build, &repo, &resources, 4).await;
        let status = summarize_feature_dag(&outcomes);

        let mut vector = FeatureVector::new(chain.scenario_id, repo.id, build.id);
        for (name, value) in features {
            vector.set(name, value);
        }
        vector.extraction_status = status;
        self.feature_vectors
            .upsert(vector.id, chain.scenario_id, &vector)
            .await
            .map_err(|e| TaskFailure::fatal(e.to_string()))?;

        let now = Utc::now();
        if status == buildrisk_core::domain::ExtractionStatus::Failed {
            enrichment_build.fail("every feature dag node failed or was skipped", now);
        } else {
            enrichment_build.complete(
                vector.id,
                status == buildrisk_core::domain::ExtractionStatus::Partial,
                now,
            );
        }
        self.enrichment_builds
            .upsert(enrichment_build.id, chain.scenario_id, &enrichment_build)
            .await
            .map_err(|e| TaskFailure::fatal(e.to_string()))?;

        let mut audit = FeatureAuditLog::new(
            chain.correlation_id,
            chain.scenario_id,
            build.id,
            chain.config_digest.clone(),
        );
        for (node_name, outcome) in &outcomes {
            let (mapped, error, skip_reason) = map_node_outcome(outcome);
            emit_node_executed(
                &chain.correlation_id.to_string(),
                node_name,
                &format!("{mapped:?}"),
                0,
            );
            audit.record_node(NodeExecutionRecord {
                node_name: node_name.to_string(),
                outcome: mapped,
                duration_ms: 0,
                resources_used: Vec::new(),
                resources_missing: Vec::new(),
                error,
                warning: None,
                skip_reason,
            });
        }
        let audit_json =
            serde_json::to_value(&audit).map_err(|e| TaskFailure::fatal(e.to_string()))?;
        self.ledger
            .append_audit_log(chain.correlation_id, audit_json)
            .await
            .map_err(|e| TaskFailure::fatal(e.to_string()))?;

        serde_json::to_value(&chain).map_err(|e| TaskFailure::fatal(e.to_string()))
    }
}

/// Terminal stage of the feature-extraction chain. `graph::feature_extraction_chain`
/// always appends one finalize stage after the per-build stages; this one is a
/// pass-through since the real aggregation (transitioning the scenario, computing
/// item counts) happens in `start_processing` once the chain returns.
struct FinalizeProcessingTask;

#[async_trait]
impl Task for FinalizeProcessingTask {
    async fn run(&self, _ctx: &TaskContext, payload: Value) -> Result<Value, TaskFailure> {
        Ok(payload)
    }
}

/// Owns the repositories, workers and runtime the Scenario Orchestrator
/// composes. Constructed once per process (CLI: one-shot; daemon: long-lived)
/// and shared behind an `Arc`.
pub struct ScenarioOrchestrator {
    runtime: Arc<Runtime>,
    scenarios: Arc<Repo<Scenario>>,
    raw_repositories: Arc<Repo<RawRepository>>,
    raw_build_runs: Arc<Repo<RawBuildRun>>,
    ingestion_builds: Arc<Repo<IngestionBuild>>,
    enrichment_builds: Arc<Repo<EnrichmentBuild>>,
    feature_vectors: Arc<Repo<FeatureVector>>,
    dataset_splits: Arc<Repo<DatasetSplit>>,
    run_pointers: Arc<Repo<RunPointer>>,
    ledger: Arc<dyn PipelineRunLedger>,
    #[allow(dead_code)]
    ci_client: Arc<dyn CiProviderClient>,
    repo_ingestion: Arc<RepoIngestionTask>,
    scan_dispatcher: Arc<ScanDispatcher>,
    events: Arc<dyn EventBus>,
    repos_root: PathBuf,
    worktrees_root: PathBuf,
    logs_root: PathBuf,
    output_root: PathBuf,
}

impl ScenarioOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<Runtime>,
        scenarios: Arc<Repo<Scenario>>,
        raw_repositories: Arc<Repo<RawRepository>>,
        raw_build_runs: Arc<Repo<RawBuildRun>>,
        ingestion_builds: Arc<Repo<IngestionBuild>>,
        enrichment_builds: Arc<Repo<EnrichmentBuild>>,
        feature_vectors: Arc<Repo<FeatureVector>>,
        dataset_splits: Arc<Repo<DatasetSplit>>,
        run_pointers: Arc<Repo<RunPointer>>,
        ledger: Arc<dyn PipelineRunLedger>,
        ci_client: Arc<dyn CiProviderClient>,
        repo_ingestion: Arc<RepoIngestionTask>,
        scan_dispatcher: Arc<ScanDispatcher>,
        events: Arc<dyn EventBus>,
        repos_root: PathBuf,
        worktrees_root: PathBuf,
        logs_root: PathBuf,
        output_root: PathBuf,
    ) -> Self {
        Self {
            runtime,
            scenarios,
            raw_repositories,
            raw_build_runs,
            ingestion_builds,
            enrichment_builds,
            feature_vectors,
            dataset_splits,
            run_pointers,
            ledger,
            ci_client,
            repo_ingestion,
            scan_dispatcher,
            events,
            repos_root,
            worktrees_root,
            logs_root,
            output_root,
        }
    }

    fn publish(&self, topic: EventTopic, scenario_id: Uuid, entity_id: Uuid, payload: Value) {
        self.events.publish(EventEnvelope {
            topic,
            scenario_id: Some(scenario_id),
            entity_id,
            payload,
        });
    }

    async fn persist_scenario(&self, scenario: &Scenario) -> CoreResult<()> {
        self.scenarios
            .upsert(scenario.id, scenario.id, scenario)
            .await
            .map_err(storage_err)?;
        self.publish(
            EventTopic::ScenarioUpdate,
            scenario.id,
            scenario.id,
            serde_json::json!({"status": scenario.status}),
        );
        Ok(())
    }

    /// Applies one repo's `RepoIngestionOutput` onto its `IngestionBuild`
    /// rows and backfills `RawBuildRun.effective_sha` for replayed commits.
    /// Shared between the Phase 2 chord callback path and
    /// `reingest_missing_resource`.
    async fn apply_repo_ingestion_output(
        &self,
        scenario_id: Uuid,
        output: &RepoIngestionOutput,
    ) -> CoreResult<()> {
        let now = Utc::now();
        for result in &output.results {
            let Ok(ingestion_build_id) = result.ingestion_build_id.parse::<Uuid>() else {
                continue;
            };
            let Some(mut ingestion_build) = self
                .ingestion_builds
                .get(ingestion_build_id)
                .await
                .map_err(storage_err)?
            else {
                continue;
            };

            let worktree_ok = result.git_worktree.status == ResourceResultStatus::Completed;
            if ingestion_build.required_resources.contains(&ResourceName::GitHistory) {
                ingestion_build.record_resource(
                    ResourceName::GitHistory,
                    if worktree_ok {
                        ResourceStatus::Completed
                    } else {
                        ResourceStatus::Failed
                    },
                    result.git_worktree.error.clone(),
                    result.git_worktree.expected_loss,
                    now,
                );
            }
            if ingestion_build.required_resources.contains(&ResourceName::GitWorktree) {
                ingestion_build.record_resource(
                    ResourceName::GitWorktree,
                    if worktree_ok {
                        ResourceStatus::Completed
                    } else {
                        ResourceStatus::Failed
                    },
                    result.git_worktree.error.clone(),
                    result.git_worktree.expected_loss,
                    now,
                );
            }
            if ingestion_build.required_resources.contains(&ResourceName::BuildLogs) {
                let logs_ok = result.build_logs.status == ResourceResultStatus::Completed;
                ingestion_build.record_resource(
                    ResourceName::BuildLogs,
                    if logs_ok {
                        ResourceStatus::Completed
                    } else {
                        ResourceStatus::Failed
                    },
                    result.build_logs.error.clone(),
                    result.build_logs.expected_loss,
                    now,
                );
            }

            self.ingestion_builds
                .upsert(ingestion_build.id, scenario_id, &ingestion_build)
                .await
                .map_err(storage_err)?;

            if let Some(effective_sha) = &result.effective_sha {
                if let Some(mut build) = self
                    .raw_build_runs
                    .get(ingestion_build.raw_build_run_id)
                    .await
                    .map_err(storage_err)?
                {
                    build.set_effective_sha(effective_sha.clone());
                    self.raw_build_runs
                        .upsert(build.id, GLOBAL_SCOPE, &build)
                        .await
                        .map_err(storage_err)?;
                }
            }
        }
        Ok(())
    }

    /// Phase 1 (Filter) + Phase 2 (Ingest). Fails fast on a concurrency
    /// conflict (another run already in flight for this scenario) and
    /// resolves everything else into the scenario's own status rather than
    /// a hard error, so a caller always has a `Scenario` row to inspect.
    pub async fn start_scenario_generation(&self, scenario_id: Uuid) -> CoreResult<()> {
        let mut scenario = self
            .scenarios
            .get(scenario_id)
            .await
            .map_err(storage_err)?
            .ok_or(DomainError::ScenarioNotFound(scenario_id))?;

        if scenario.status.is_in_flight() {
            return Err(DomainError::Conflict(format!(
                "scenario {scenario_id} already has a run in flight (status {:?})",
                scenario.status
            )));
        }

        let config_value = serde_json::to_value(&(
            &scenario.data_source,
            &scenario.features,
            &scenario.splitting,
            &scenario.preprocessing,
            &scenario.output,
        ))?;
        let config_digest = compute_digest(&config_value)?;

        let mut run = PipelineRun::new(scenario_id, config_digest);
        let correlation_id = run.correlation_id;
        let now = Utc::now();
        run.start_phase(Phase::Filter, now);
        let mut recorder = PipelineRunRecorder::start(self.ledger.clone(), run)
            .await
            .map_err(storage_err)?;

        let pointer = RunPointer { correlation_id };
        self.run_pointers
            .upsert(scenario_id, scenario_id, &pointer)
            .await
            .map_err(storage_err)?;

        scenario.transition(ScenarioStatus::Filtering, now)?;
        self.persist_scenario(&scenario).await?;

        let raw_repos = self
            .raw_repositories
            .list_by_scenario(GLOBAL_SCOPE)
            .await
            .map_err(storage_err)?;
        let raw_repos_by_id: HashMap<Uuid, RawRepository> =
            raw_repos.into_iter().map(|r| (r.id, r)).collect();
        let raw_builds = self
            .raw_build_runs
            .list_by_scenario(GLOBAL_SCOPE)
            .await
            .map_err(storage_err)?;

        let matched: Vec<(RawRepository, RawBuildRun)> = raw_builds
            .into_iter()
            .filter_map(|build| {
                let repo = raw_repos_by_id.get(&build.raw_repo_id)?.clone();
                if filter_matches(&scenario.data_source, &repo, &build) {
                    Some((repo, build))
                } else {
                    None
                }
            })
            .collect();

        if matched.is_empty() {
            let at = Utc::now();
            recorder
                .run_mut()
                .fail_phase(Phase::Filter, "no repositories or builds matched the data source filter", at);
            recorder.record_phase(Phase::Filter).await.map_err(storage_err)?;
            scenario.fail("no repositories or builds matched the data source filter", at)?;
            self.persist_scenario(&scenario).await?;
            recorder.finish(at).await.map_err(storage_err)?;
            return Ok(());
        }

        let plan = resolve_feature_dag(&scenario.features.dag_features)
            .map_err(|e| DomainError::Configuration(format!("feature dag cycle: {e:?}")))?;
        let mut required_resource_names: Vec<ResourceName> = plan
            .required_resources
            .iter()
            .filter_map(|r| resource_requirement_to_name(*r))
            .collect();
        required_resource_names.sort();
        required_resource_names.dedup();
        let scan_enabled = scenario.features.scan_enabled();
        let required_resources: Vec<ResourceName> = resolve_resource_dag(&required_resource_names, scan_enabled)
            .into_iter()
            .flatten()
            .collect();

        let mut builds_by_repo: HashMap<Uuid, Vec<(IngestionBuild, RawBuildRun)>> = HashMap::new();
        for (repo, build) in &matched {
            let ingestion_build = IngestionBuild::new(
                scenario_id,
                repo.id,
                build.id,
                build.commit_sha.clone(),
                build.ci_run_id.clone(),
                required_resources.clone(),
            );
            self.ingestion_builds
                .upsert(ingestion_build.id, scenario_id, &ingestion_build)
                .await
                .map_err(storage_err)?;
            builds_by_repo
                .entry(repo.id)
                .or_default()
                .push((ingestion_build, build.clone()));
        }

        scenario.builds_total = matched.len() as u64;
        let at = Utc::now();
        recorder.run_mut().complete_phase(Phase::Filter, matched.len() as u64, at);
        recorder.record_phase(Phase::Filter).await.map_err(storage_err)?;
        scenario.transition(ScenarioStatus::Ingesting, at)?;
        self.persist_scenario(&scenario).await?;
        recorder.run_mut().start_phase(Phase::Ingest, Utc::now());
        recorder.record_phase(Phase::Ingest).await.map_err(storage_err)?;

        let mut repo_ids: Vec<Uuid> = Vec::new();
        let mut repo_args: Vec<Value> = Vec::new();
        for (repo_id, entries) in &builds_by_repo {
            let repo = raw_repos_by_id
                .get(repo_id)
                .expect("repo present for every matched build");
            let build_specs: Vec<RepoIngestionBuildSpec> = entries
                .iter()
                .map(|(ingestion_build, build)| RepoIngestionBuildSpec {
                    ingestion_build_id: ingestion_build.id.to_string(),
                    commit_sha: build.commit_sha.clone(),
                    parent_sha: None,
                    ci_run_id: build.ci_run_id.clone(),
                })
                .collect();
            let input = RepoIngestionInput {
                raw_repo_id: repo.id.to_string(),
                full_name: repo.full_name.clone(),
                clone_url: default_clone_url(&repo.full_name),
                repos_root: self.repos_root.clone(),
                worktrees_root: self.worktrees_root.clone(),
                logs_root: self.logs_root.clone(),
                builds: build_specs,
            };
            repo_ids.push(*repo_id);
            repo_args.push(serde_json::to_value(input)?);
        }

        let chain_task: Arc<dyn Task> = self.repo_ingestion.clone();
        let ctx = TaskContext::new();
        let repo_ids_for_callback = repo_ids.clone();
        let chord_result = ingestion_chord(
            self.runtime.as_ref(),
            &ctx,
            chain_task,
            repo_args,
            move |results| {
                let entries: Vec<Value> = repo_ids_for_callback
                    .iter()
                    .zip(results)
                    .map(|(repo_id, result)| match result {
                        Ok(value) => serde_json::json!({"repo_id": repo_id, "ok": true, "output": value}),
                        Err(failure) => {
                            serde_json::json!({"repo_id": repo_id, "ok": false, "error": failure.message})
                        }
                    })
                    .collect();
                Ok(serde_json::json!({"repos": entries}))
            },
        )
        .await;

        let summary = match chord_result {
            Ok(value) => value,
            Err(failure) => {
                let at = Utc::now();
                recorder
                    .run_mut()
                    .fail_phase(Phase::Ingest, failure.message.clone(), at);
                recorder.record_phase(Phase::Ingest).await.map_err(storage_err)?;
                scenario.fail(failure.message, at)?;
                self.persist_scenario(&scenario).await?;
                recorder.finish(at).await.map_err(storage_err)?;
                return Ok(());
            }
        };

        let entries = summary
            .get("repos")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut ingested_count = 0u64;
        for entry in entries {
            let Some(repo_id) = entry
                .get("repo_id")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Uuid>().ok())
            else {
                continue;
            };
            let ok = entry.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let Some(group) = builds_by_repo.get(&repo_id) else {
                continue;
            };

            if !ok {
                let reason = entry
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("repo ingestion task failed")
                    .to_string();
                for (ingestion_build, _build) in group {
                    let mut ingestion_build = ingestion_build.clone();
                    ingestion_build.mark_missing_resource(reason.clone(), Utc::now());
                    self.ingestion_builds
                        .upsert(ingestion_build.id, scenario_id, &ingestion_build)
                        .await
                        .map_err(storage_err)?;
                }
                continue;
            }

            let output: RepoIngestionOutput = entry
                .get("output")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or(RepoIngestionOutput { results: Vec::new() });
            ingested_count += output.results.len() as u64;
            self.apply_repo_ingestion_output(scenario_id, &output).await?;
        }

        scenario.builds_ingested = ingested_count;
        let at = Utc::now();
        recorder
            .run_mut()
            .complete_phase(Phase::Ingest, ingested_count, at);
        recorder.record_phase(Phase::Ingest).await.map_err(storage_err)?;
        scenario.transition(ScenarioStatus::Ingested, at)?;
        self.persist_scenario(&scenario).await?;

        Ok(())
    }

    /// Resumes the `PipelineRun` a prior `start_scenario_generation` call
    /// created and drives Phase 3 (Process) + Phase 4 (Split). Calling
    /// `PipelineRunRecorder::start` again on the already-persisted run is
    /// deliberate: `ledger.create_run` updates the existing row keyed by
    /// correlation id instead of inserting a sibling one, so this only
    /// costs a redundant write plus a re-emitted `run.started` event.
    pub async fn start_processing(&self, scenario_id: Uuid) -> CoreResult<()> {
        let mut scenario = self
            .scenarios
            .get(scenario_id)
            .await
            .map_err(storage_err)?
            .ok_or(DomainError::ScenarioNotFound(scenario_id))?;

        if scenario.status != ScenarioStatus::Ingested {
            return Err(DomainError::Conflict(format!(
                "scenario {scenario_id} is not ready for processing (status {:?})",
                scenario.status
            )));
        }

        let pointer = self
            .run_pointers
            .get(scenario_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| DomainError::Configuration("missing pipeline run pointer".into()))?;
        let run = load_run(self.ledger.as_ref(), pointer.correlation_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| DomainError::Configuration("pipeline run record missing".into()))?;
        let correlation_id = run.correlation_id;
        let config_digest = run.config_digest.clone();
        let mut recorder = PipelineRunRecorder::start(self.ledger.clone(), run)
            .await
            .map_err(storage_err)?;

        let now = Utc::now();
        scenario.transition(ScenarioStatus::Processing, now)?;
        self.persist_scenario(&scenario).await?;
        recorder.run_mut().start_phase(Phase::Process, now);
        recorder.record_phase(Phase::Process).await.map_err(storage_err)?;

        let ingestion_builds = self
            .ingestion_builds
            .list_by_scenario(scenario_id)
            .await
            .map_err(storage_err)?;

        let mut enrichment_build_ids: Vec<Uuid> = Vec::new();
        for ingestion_build in &ingestion_builds {
            if !matches!(
                ingestion_build.status,
                buildrisk_core::domain::IngestionStatus::Ingested
                    | buildrisk_core::domain::IngestionStatus::MissingResource
            ) {
                continue;
            }
            let Some(raw_build) = self
                .raw_build_runs
                .get(ingestion_build.raw_build_run_id)
                .await
                .map_err(storage_err)?
            else {
                continue;
            };
            let mut enrichment_build = EnrichmentBuild::new(
                scenario_id,
                ingestion_build.id,
                ingestion_build.raw_repo_id,
                ingestion_build.raw_build_run_id,
                ingestion_build.commit_sha.clone(),
                ingestion_build.ci_run_id.clone(),
                raw_build.started_at.unwrap_or(raw_build.created_at),
            );
            enrichment_build.outcome = raw_build.conclusion.and_then(BuildConclusion::outcome_label);
            self.enrichment_builds
                .upsert(enrichment_build.id, scenario_id, &enrichment_build)
                .await
                .map_err(storage_err)?;
            enrichment_build_ids.push(enrichment_build.id);
        }

        if enrichment_build_ids.is_empty() {
            let at = Utc::now();
            recorder.run_mut().complete_phase(Phase::Process, 0, at);
            recorder.record_phase(Phase::Process).await.map_err(storage_err)?;
            scenario.transition(ScenarioStatus::Processed, at)?;
            self.persist_scenario(&scenario).await?;
            return self.run_split_phase(scenario, recorder).await;
        }

        let process_task: Arc<dyn Task> = Arc::new(ProcessBuildTask {
            enrichment_builds: self.enrichment_builds.clone(),
            ingestion_builds: self.ingestion_builds.clone(),
            raw_build_runs: self.raw_build_runs.clone(),
            raw_repositories: self.raw_repositories.clone(),
            feature_vectors: self.feature_vectors.clone(),
            ledger: self.ledger.clone(),
            repos_root: self.repos_root.clone(),
            worktrees_root: self.worktrees_root.clone(),
            logs_root: self.logs_root.clone(),
        });
        let finalize_task: Arc<dyn Task> = Arc::new(FinalizeProcessingTask);

        let initial_payload = ProcessChainPayload {
            remaining_ids: enrichment_build_ids.clone(),
            scenario_id,
            correlation_id,
            config_digest,
            dag_features: scenario.features.dag_features.clone(),
        };
        let mut build_args: Vec<Value> = Vec::with_capacity(enrichment_build_ids.len());
        build_args.push(serde_json::to_value(&initial_payload)?);
        for _ in 1..enrichment_build_ids.len() {
            build_args.push(Value::Null);
        }

        let ctx = TaskContext::new();
        let chain_result = feature_extraction_chain(
            self.runtime.as_ref(),
            &ctx,
            process_task,
            finalize_task,
            build_args,
            Value::Null,
        )
        .await;

        match chain_result {
            Ok(_) => {
                let at = Utc::now();
                scenario.builds_features_extracted = enrichment_build_ids.len() as u64;
                recorder
                    .run_mut()
                    .complete_phase(Phase::Process, enrichment_build_ids.len() as u64, at);
                recorder.record_phase(Phase::Process).await.map_err(storage_err)?;
                scenario.transition(ScenarioStatus::Processed, at)?;
                self.persist_scenario(&scenario).await?;
            }
            Err(failure) => {
                let at = Utc::now();
                recorder
                    .run_mut()
                    .fail_phase(Phase::Process, failure.message.clone(), at);
                recorder.record_phase(Phase::Process).await.map_err(storage_err)?;
                scenario.fail(failure.message, at)?;
                self.persist_scenario(&scenario).await?;
                recorder.finish(at).await.map_err(storage_err)?;
                return Ok(());
            }
        }

        if scenario.features.scan_enabled() {
            self.dispatch_scans(&scenario).await?;
        }

        self.run_split_phase(scenario, recorder).await
    }

    async fn dispatch_scans(&self, scenario: &Scenario) -> CoreResult<()> {
        let enrichment_builds = self
            .enrichment_builds
            .list_by_scenario(scenario.id)
            .await
            .map_err(storage_err)?;

        let mut units_by_repo: HashMap<Uuid, (Vec<Uuid>, String)> = HashMap::new();
        for enrichment_build in enrichment_builds.iter().filter(|e| e.has_feature_vector()) {
            if let Some(fv_id) = enrichment_build.feature_vector_id {
                units_by_repo
                    .entry(enrichment_build.raw_repo_id)
                    .or_insert_with(|| (Vec::new(), enrichment_build.commit_sha.clone()))
                    .0
                    .push(fv_id);
            }
        }

        let mut units = Vec::with_capacity(units_by_repo.len());
        let mut tool_configs = HashMap::new();
        let (trivy_cfg, sonar_cfg) = scan_config_contents(&scenario.features.scan_config);
        for (raw_repo_id, (feature_vector_ids, commit_sha)) in units_by_repo {
            let Some(repo) = self.raw_repositories.get(raw_repo_id).await.map_err(storage_err)? else {
                continue;
            };
            let worktree_path = self
                .worktrees_root
                .join(&commit_sha[..commit_sha.len().min(12)]);
            units.push(ScanUnit {
                raw_repo_id,
                github_repo_id: repo.external_repo_id.clone(),
                full_name: repo.full_name.clone(),
                commit_sha,
                worktree_path,
                feature_vector_ids,
            });
            tool_configs.insert(raw_repo_id, (trivy_cfg.clone(), sonar_cfg.clone()));
        }

        if units.is_empty() {
            return Ok(());
        }

        let scan_sonar = !scenario.features.sonarqube_metrics.is_empty();
        let scan_trivy = !scenario.features.trivy_metrics.is_empty();
        let scenario_id = scenario.id;
        let scans_total = units.len() as u64;

        let mut scenario = scenario.clone();
        scenario.scans_total = scans_total;
        self.persist_scenario(&scenario).await?;

        let dispatcher = self.scan_dispatcher.clone();
        let scenarios = self.scenarios.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = dispatcher
                .dispatch_all(scenario_id, units, scan_sonar, scan_trivy, &tool_configs)
                .await;
            if let Ok(Some(mut scenario)) = scenarios.get(scenario_id).await {
                scenario.scans_completed += outcome.completed() as u64;
                scenario.scans_failed += outcome.failed() as u64;
                scenario.scan_extraction_completed =
                    scenario.scans_completed + scenario.scans_failed >= scenario.scans_total;
                let _ = scenarios.upsert(scenario_id, scenario_id, &scenario).await;
                events.publish(EventEnvelope {
                    topic: EventTopic::ScanUpdate,
                    scenario_id: Some(scenario_id),
                    entity_id: scenario_id,
                    payload: serde_json::json!({
                        "completed": outcome.completed(),
                        "failed": outcome.failed(),
                    }),
                });
            }
        });

        Ok(())
    }

    /// Phase 4 (Split): builds the in-memory dataset frame out of every
    /// build with a usable feature vector, applies preprocessing, splits
    /// into train/validation/test, and exports each partition to disk.
    async fn run_split_phase(
        &self,
        mut scenario: Scenario,
        mut recorder: PipelineRunRecorder,
    ) -> CoreResult<()> {
        let scenario_id = scenario.id;
        let at = Utc::now();
        scenario.transition(ScenarioStatus::Splitting, at)?;
        self.persist_scenario(&scenario).await?;
        recorder.run_mut().start_phase(Phase::Split, at);
        recorder.record_phase(Phase::Split).await.map_err(storage_err)?;

        let enrichment_builds = self
            .enrichment_builds
            .list_by_scenario(scenario_id)
            .await
            .map_err(storage_err)?;
        let usable: Vec<EnrichmentBuild> = enrichment_builds
            .into_iter()
            .filter(|e| e.has_feature_vector())
            .collect();

        let mut rows = Vec::with_capacity(usable.len());
        let mut feature_names: Vec<String> = Vec::new();
        for enrichment_build in &usable {
            let Some(feature_vector_id) = enrichment_build.feature_vector_id else {
                continue;
            };
            let Some(vector) = self
                .feature_vectors
                .get(feature_vector_id)
                .await
                .map_err(storage_err)?
            else {
                continue;
            };
            let repo = self
                .raw_repositories
                .get(enrichment_build.raw_repo_id)
                .await
                .map_err(storage_err)?;

            let mut features = vector.features.clone();
            for (name, value) in vector.scan_metrics.clone() {
                features.insert(name, value);
            }
            for name in features.keys() {
                if !feature_names.iter().any(|n| n == name) {
                    feature_names.push(name.clone());
                }
            }

            rows.push(DatasetRow {
                enrichment_build_id: enrichment_build.id,
                raw_repo_id: enrichment_build.raw_repo_id,
                primary_language: repo.and_then(|r| r.primary_language),
                build_started_at: Some(enrichment_build.build_started_at),
                outcome: enrichment_build.outcome,
                features,
                group_value: None,
            });
        }
        feature_names.sort();

        let kept_names = apply_preprocessing(&mut rows, &scenario.preprocessing, &feature_names);
        let split_result: SplitResult = split_dataset(rows, &scenario.splitting);

        let output_dir = self.output_root.join(scenario_id.to_string());
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| DomainError::Fatal(format!("failed to create output dir: {e}")))?;

        let partitions: [(SplitAssignment, buildrisk_core::domain::SplitType, &Vec<DatasetRow>); 3] = [
            (
                SplitAssignment::Train,
                buildrisk_core::domain::SplitType::Train,
                &split_result.train,
            ),
            (
                SplitAssignment::Validation,
                buildrisk_core::domain::SplitType::Validation,
                &split_result.validation,
            ),
            (
                SplitAssignment::Test,
                buildrisk_core::domain::SplitType::Test,
                &split_result.test,
            ),
        ];

        let format = scenario.output.format;
        let extension = match format {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
            OutputFormat::Pickle => "pkl",
        };

        let mut total_records = 0u64;
        for (assignment, split_type, rows_ref) in partitions {
            for row in rows_ref.iter() {
                if let Some(mut enrichment_build) = self
                    .enrichment_builds
                    .get(row.enrichment_build_id)
                    .await
                    .map_err(storage_err)?
                {
                    enrichment_build.assign_split(assignment, row.group_value.clone().unwrap_or_default());
                    self.enrichment_builds
                        .upsert(enrichment_build.id, scenario_id, &enrichment_build)
                        .await
                        .map_err(storage_err)?;
                }
            }

            let file_name = format!("{split_type:?}").to_lowercase() + "." + extension;
            let file_path = output_dir.join(&file_name);
            let started = Utc::now();
            export(rows_ref, &kept_names, format, &file_path)
                .map_err(|e| DomainError::Fatal(format!("export failed: {e}")))?;
            let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
            let file_size_bytes = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
            let checksum = md5_checksum_of(&file_path).ok();
            let class_distribution = SplitResult::class_distribution(rows_ref);
            let group_distribution = SplitResult::group_distribution(rows_ref);

            let dataset_split = DatasetSplit::new(
                scenario_id,
                split_type,
                file_name,
                format,
                kept_names.clone(),
                rows_ref.len() as u64,
                class_distribution,
                group_distribution,
                file_size_bytes,
                duration_ms,
                checksum,
            );
            total_records += dataset_split.record_count;
            self.dataset_splits
                .upsert(dataset_split.id, scenario_id, &dataset_split)
                .await
                .map_err(storage_err)?;
        }

        let at = Utc::now();
        recorder.run_mut().complete_phase(Phase::Split, total_records, at);
        recorder.record_phase(Phase::Split).await.map_err(storage_err)?;
        scenario.transition(ScenarioStatus::Completed, at)?;
        self.persist_scenario(&scenario).await?;
        recorder.finish(at).await.map_err(storage_err)?;

        Ok(())
    }

    /// Resets one build's resource-acquisition state and re-runs ingestion
    /// for it alone, outside the batched chord used by Phase 2.
    pub async fn reingest_missing_resource(
        &self,
        scenario_id: Uuid,
        ingestion_build_id: Uuid,
    ) -> CoreResult<()> {
        let mut ingestion_build = self
            .ingestion_builds
            .get(ingestion_build_id)
            .await
            .map_err(storage_err)?
            .ok_or(DomainError::BuildNotFound(ingestion_build_id))?;
        if ingestion_build.scenario_id != scenario_id {
            return Err(DomainError::Conflict(
                "ingestion build does not belong to the given scenario".into(),
            ));
        }

        ingestion_build.reset_for_reingestion(Utc::now());
        self.ingestion_builds
            .upsert(ingestion_build.id, scenario_id, &ingestion_build)
            .await
            .map_err(storage_err)?;

        let repo = self
            .raw_repositories
            .get(ingestion_build.raw_repo_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| DomainError::Configuration("raw repository missing".into()))?;
        let build = self
            .raw_build_runs
            .get(ingestion_build.raw_build_run_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| DomainError::Configuration("raw build run missing".into()))?;

        let input = RepoIngestionInput {
            raw_repo_id: repo.id.to_string(),
            full_name: repo.full_name.clone(),
            clone_url: default_clone_url(&repo.full_name),
            repos_root: self.repos_root.clone(),
            worktrees_root: self.worktrees_root.clone(),
            logs_root: self.logs_root.clone(),
            builds: vec![RepoIngestionBuildSpec {
                ingestion_build_id: ingestion_build.id.to_string(),
                commit_sha: build.commit_sha.clone(),
                parent_sha: None,
                ci_run_id: build.ci_run_id.clone(),
            }],
        };
        let payload = serde_json::to_value(input)?;
        let ctx = TaskContext::new();
        match self.repo_ingestion.run(&ctx, payload).await {
            Ok(value) => {
                let output: RepoIngestionOutput = serde_json::from_value(value)?;
                self.apply_repo_ingestion_output(scenario_id, &output).await?;
            }
            Err(failure) => {
                ingestion_build.mark_missing_resource(failure.message, Utc::now());
                self.ingestion_builds
                    .upsert(ingestion_build.id, scenario_id, &ingestion_build)
                    .await
                    .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    /// Re-dispatches a single commit's scan, delegating to the Scan
    /// Dispatcher's own retry path (which issues a fresh tracking row
    /// rather than mutating the old one).
    pub async fn retry_commit_scan(
        &self,
        scenario_id: Uuid,
        raw_repo_id: Uuid,
        commit_sha: &str,
        tool: ScanTool,
    ) -> CoreResult<()> {
        let repo = self
            .raw_repositories
            .get(raw_repo_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| DomainError::Configuration("raw repository missing".into()))?;
        let mut scenario = self
            .scenarios
            .get(scenario_id)
            .await
            .map_err(storage_err)?
            .ok_or(DomainError::ScenarioNotFound(scenario_id))?;

        let feature_vector_ids: Vec<Uuid> = self
            .feature_vectors
            .list_by_scenario(scenario_id)
            .await
            .map_err(storage_err)?
            .into_iter()
            .filter(|fv| fv.raw_repo_id == raw_repo_id)
            .map(|fv| fv.id)
            .collect();

        let worktree_path = self
            .worktrees_root
            .join(&commit_sha[..commit_sha.len().min(12)]);
        let unit = ScanUnit {
            raw_repo_id,
            github_repo_id: repo.external_repo_id.clone(),
            full_name: repo.full_name.clone(),
            commit_sha: commit_sha.to_string(),
            worktree_path,
            feature_vector_ids,
        };

        let (trivy_cfg, sonar_cfg) = scan_config_contents(&scenario.features.scan_config);
        let config_contents = match tool {
            ScanTool::Trivy => trivy_cfg,
            ScanTool::Sonarqube => sonar_cfg,
        };

        let outcome = self
            .scan_dispatcher
            .retry_commit_scan(scenario_id, &unit, tool, &config_contents)
            .await;
        scenario.scans_completed += outcome.completed() as u64;
        scenario.scans_failed += outcome.failed() as u64;
        self.persist_scenario(&scenario).await?;
        Ok(())
    }

    /// Webhook landing point for an asynchronously-completed SonarQube
    /// analysis, identified by the component key the Scan Dispatcher
    /// assigned at dispatch time.
    pub async fn on_sonar_analysis_complete(
        &self,
        scenario_id: Uuid,
        component_key: &str,
        feature_vector_ids: &[Uuid],
        metrics: HashMap<String, f64>,
    ) -> CoreResult<()> {
        self.scan_dispatcher
            .on_sonar_analysis_complete(component_key, feature_vector_ids, metrics)
            .await
            .map_err(|e| DomainError::Fatal(format!("sonar webhook processing failed: {e}")))?;

        let mut scenario = self
            .scenarios
            .get(scenario_id)
            .await
            .map_err(storage_err)?
            .ok_or(DomainError::ScenarioNotFound(scenario_id))?;
        scenario.scans_completed += 1;
        scenario.scan_extraction_completed =
            scenario.scans_completed + scenario.scans_failed >= scenario.scans_total;
        self.persist_scenario(&scenario).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildrisk_core::runtime::queue;
    use buildrisk_state::fakes::{InMemoryEntityStore, InMemoryPipelineRunLedger};
    use buildrisk_state::EntityStore;

    use crate::events::BroadcastEventBus;
    use crate::locks::RepoLockRegistry;
    use crate::provider::FakeCiProviderClient;
    use crate::scan::{FakeScannerClient, ScanBatchConfig, ScannerClient};
    use crate::tasks::{CloneRepoTask, CreateWorktreesBatchTask, DownloadBuildLogsTask};

    struct Fixture {
        orchestrator: ScenarioOrchestrator,
        scenarios: Arc<Repo<Scenario>>,
        _tmp: tempfile::TempDir,
    }

    /// Wires a `ScenarioOrchestrator` over in-memory fakes, the same way
    /// `buildrisk-cli`'s `build_orchestrator` wires one over `SurrealStore`.
    /// Real network/git-backed ingestion is never exercised here; these
    /// tests cover the guards and lookups that run before any task is
    /// dispatched.
    fn build_fixture() -> Fixture {
        let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        let ledger: Arc<dyn PipelineRunLedger> = Arc::new(InMemoryPipelineRunLedger::new());

        let scenarios: Arc<Repo<Scenario>> = Arc::new(Repo::new(store.clone(), "scenario"));
        let raw_repositories: Arc<Repo<RawRepository>> =
            Arc::new(Repo::new(store.clone(), "raw_repository"));
        let raw_build_runs: Arc<Repo<RawBuildRun>> =
            Arc::new(Repo::new(store.clone(), "raw_build_run"));
        let ingestion_builds: Arc<Repo<IngestionBuild>> =
            Arc::new(Repo::new(store.clone(), "ingestion_build"));
        let enrichment_builds: Arc<Repo<EnrichmentBuild>> =
            Arc::new(Repo::new(store.clone(), "enrichment_build"));
        let feature_vectors: Arc<Repo<FeatureVector>> =
            Arc::new(Repo::new(store.clone(), "feature_vector"));
        let dataset_splits: Arc<Repo<DatasetSplit>> =
            Arc::new(Repo::new(store.clone(), "dataset_split"));
        let run_pointers: Arc<Repo<RunPointer>> = Arc::new(Repo::new(store.clone(), run_pointer_kind()));
        let sonar_pending = Arc::new(Repo::new(store.clone(), "sonar_scan_pending"));
        let trivy_scans = Arc::new(Repo::new(store.clone(), "trivy_commit_scan"));

        let ci_client: Arc<dyn CiProviderClient> = Arc::new(FakeCiProviderClient::new());
        let locks = Arc::new(RepoLockRegistry::new());
        let full_name_by_repo_id: Arc<dyn Fn(&str) -> Option<String> + Send + Sync> =
            Arc::new(|_: &str| None);
        let clone_task = Arc::new(CloneRepoTask::new(locks.clone()));
        let worktrees_task = Arc::new(CreateWorktreesBatchTask::new(
            locks.clone(),
            ci_client.clone(),
            full_name_by_repo_id,
        ));
        let logs_task = Arc::new(DownloadBuildLogsTask::new(ci_client.clone()));
        let repo_ingestion = Arc::new(RepoIngestionTask::new(clone_task, worktrees_task, logs_task));

        let sonar_client: Arc<dyn ScannerClient> = Arc::new(FakeScannerClient::new());
        let trivy_client: Arc<dyn ScannerClient> = Arc::new(FakeScannerClient::new());
        let tmp = tempfile::tempdir().expect("tempdir");
        let scan_dispatcher = Arc::new(ScanDispatcher::new(
            sonar_client,
            trivy_client,
            feature_vectors.clone(),
            sonar_pending,
            trivy_scans,
            tmp.path().join("scan-config"),
            ScanBatchConfig::default(),
        ));

        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let runtime = Arc::new(Runtime::start(&[
            (queue::SCENARIO_INGESTION, 1),
            (queue::SCENARIO_PROCESSING, 1),
            (queue::SCENARIO_SCANNING, 1),
            (queue::SONAR_SCAN, 1),
            (queue::TRIVY_SCAN, 1),
        ]));

        let orchestrator = ScenarioOrchestrator::new(
            runtime,
            scenarios.clone(),
            raw_repositories,
            raw_build_runs,
            ingestion_builds,
            enrichment_builds,
            feature_vectors,
            dataset_splits,
            run_pointers,
            ledger,
            ci_client,
            repo_ingestion,
            scan_dispatcher,
            events,
            tmp.path().join("repos"),
            tmp.path().join("worktrees"),
            tmp.path().join("logs"),
            tmp.path().join("output"),
        );

        Fixture { orchestrator, scenarios, _tmp: tmp }
    }

    #[tokio::test]
    async fn start_scenario_generation_rejects_unknown_scenario() {
        let fx = build_fixture();
        let err = fx
            .orchestrator
            .start_scenario_generation(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::ScenarioNotFound(_)));
    }

    #[tokio::test]
    async fn start_scenario_generation_rejects_in_flight_scenario() {
        let fx = build_fixture();
        let mut scenario = Scenario::new(Uuid::new_v4(), "risk-v1", "name: risk-v1\n");
        scenario.transition(ScenarioStatus::Filtering, Utc::now()).unwrap();
        fx.scenarios.upsert(scenario.id, scenario.id, &scenario).await.unwrap();

        let err = fx
            .orchestrator
            .start_scenario_generation(scenario.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn retry_commit_scan_reports_unknown_repo() {
        let fx = build_fixture();
        let err = fx
            .orchestrator
            .retry_commit_scan(Uuid::new_v4(), Uuid::new_v4(), "deadbeef", ScanTool::Trivy)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Configuration(_)));
    }

    #[tokio::test]
    async fn on_sonar_analysis_complete_rejects_unknown_scenario() {
        let fx = build_fixture();
        let err = fx
            .orchestrator
            .on_sonar_analysis_complete(Uuid::new_v4(), "component:key", &[], HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::ScenarioNotFound(_)));
    }

    #[test]
    fn filter_matches_all_mode_ignores_repo_language() {
        let cfg = DataSourceConfig { filter_mode: FilterMode::All, ..Default::default() };
        let repo = RawRepository::new("acme/widgets", "123");
        let build = RawBuildRun::new(Uuid::new_v4(), "run-1", "github_actions", "abcdef");
        assert!(filter_matches(&cfg, &repo, &build));
    }

    #[test]
    fn filter_matches_by_language_is_case_insensitive_and_filters_others_out() {
        let cfg = DataSourceConfig {
            filter_mode: FilterMode::ByLanguage,
            languages: vec!["rust".to_string()],
            ..Default::default()
        };
        let mut repo = RawRepository::new("acme/widgets", "123");
        let build = RawBuildRun::new(Uuid::new_v4(), "run-1", "github_actions", "abcdef");

        repo.primary_language = Some("python".to_string());
        assert!(!filter_matches(&cfg, &repo, &build));

        repo.primary_language = Some("Rust".to_string());
        assert!(filter_matches(&cfg, &repo, &build));
    }

    #[test]
    fn filter_matches_excludes_bot_commits_when_configured() {
        let cfg = DataSourceConfig {
            filter_mode: FilterMode::All,
            exclude_bots: true,
            ..Default::default()
        };
        let repo = RawRepository::new("acme/widgets", "123");
        let mut build = RawBuildRun::new(Uuid::new_v4(), "run-1", "github_actions", "abcdef");
        build.is_bot_commit = true;
        assert!(!filter_matches(&cfg, &repo, &build));
    }

    #[test]
    fn default_clone_url_assumes_github_https() {
        assert_eq!(default_clone_url("acme/widgets"), "https://github.com/acme/widgets.git");
    }
}
