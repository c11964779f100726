//! Operator CLI for the build-risk feature extraction and
//! dataset-generation platform.
//!
//! ## Commands
//!
//! - `repo register` / `build register`: seed the raw inventory a scenario
//!   filters against.
//! - `scenario create` / `scenario show`: parse a scenario YAML and inspect
//!   its stored state.
//! - `run generate` / `run process`: drive Filter+Ingest, then
//!   Process+Split.
//! - `reingest`: retry resource acquisition for one build outside a batch.
//! - `scan retry` / `scan sonar-webhook`: re-dispatch a commit scan or land
//!   an asynchronous SonarQube webhook result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use uuid::Uuid;

use buildrisk_core::domain::{
    BuildConclusion, DatasetSplit, EnrichmentBuild, FeatureVector, IngestionBuild, RawBuildRun,
    RawRepository, ScanTool, SonarScanPending, TrivyCommitScan,
};
use buildrisk_core::runtime::queue;
use buildrisk_core::{build_scenario, init_tracing, Runtime, Scenario};
use buildrisk_orchestrator::{
    run_pointer_kind, BroadcastEventBus, CiProviderClient, CloneRepoTask,
    CreateWorktreesBatchTask, DownloadBuildLogsTask, EventBus, FakeCiProviderClient,
    FakeScannerClient, GithubActionsClient, RepoIngestionTask, RepoLockRegistry, Repo,
    RunPointer, ScanBatchConfig, ScanDispatcher, ScannerClient, ScenarioOrchestrator,
};
use buildrisk_state::{PipelineRunLedger, SurrealStore, GLOBAL_SCOPE};

#[derive(Parser)]
#[command(name = "buildrisk")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the build-risk dataset platform", long_about = None)]
struct Cli {
    /// Enable verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root directory for clones, worktrees, downloaded logs and exports
    #[arg(long, global = true, default_value = ".buildrisk-data", env = "BUILDRISK_DATA_ROOT")]
    data_root: PathBuf,

    /// CI provider backing repo ingestion (fake is safe to run without network access)
    #[arg(long, global = true, value_enum, default_value_t = CiProviderKind::Fake)]
    ci_provider: CiProviderKind,

    /// GitHub token, required when --ci-provider=github
    #[arg(long, global = true, env = "GITHUB_TOKEN")]
    github_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CiProviderKind {
    Fake,
    Github,
}

#[derive(Subcommand)]
enum Commands {
    /// Raw repository inventory
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },
    /// Raw CI build-run inventory
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },
    /// Scenario configuration and status
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },
    /// Drive the scenario generation pipeline
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Retry resource acquisition for one already-filtered build
    Reingest {
        scenario_id: Uuid,
        ingestion_build_id: Uuid,
    },
    /// Scan dispatch operations
    Scan {
        #[command(subcommand)]
        action: ScanAction,
    },
}

#[derive(Subcommand)]
enum RepoAction {
    /// Register a repository in the raw inventory
    Register {
        /// `owner/repo`
        full_name: String,
        /// Provider-native repository id
        external_repo_id: String,
        #[arg(long)]
        private: bool,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        language: Option<String>,
    },
}

#[derive(Subcommand)]
enum BuildAction {
    /// Register a CI build run in the raw inventory
    Register {
        raw_repo_id: Uuid,
        ci_run_id: String,
        /// CI provider name, matched against a scenario's `ci_provider` filter
        provider: String,
        commit_sha: String,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long)]
        bot_commit: bool,
        /// success | failure | cancelled | timed_out | action_required | skipped | neutral
        #[arg(long)]
        conclusion: Option<String>,
        #[arg(long)]
        logs_available: bool,
    },
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// Parse a scenario YAML file and persist it
    Create {
        owner_id: Uuid,
        name: String,
        yaml_path: PathBuf,
    },
    /// Print a scenario's current state as JSON
    Show { scenario_id: Uuid },
}

#[derive(Subcommand)]
enum RunAction {
    /// Phase 1 (Filter) + Phase 2 (Ingest)
    Generate { scenario_id: Uuid },
    /// Phase 3 (Process) + Phase 4 (Split), resuming the run Generate started
    Process { scenario_id: Uuid },
}

#[derive(Subcommand)]
enum ScanAction {
    /// Re-dispatch a single commit's scan for one tool
    Retry {
        scenario_id: Uuid,
        raw_repo_id: Uuid,
        commit_sha: String,
        #[arg(value_enum)]
        tool: ToolArg,
    },
    /// Land an asynchronous SonarQube analysis-complete webhook
    SonarWebhook {
        scenario_id: Uuid,
        component_key: String,
        /// JSON object of metric name to value, e.g. '{"coverage": 81.4}'
        metrics_json: String,
        #[arg(long = "feature-vector")]
        feature_vectors: Vec<Uuid>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ToolArg {
    Trivy,
    Sonarqube,
}

impl From<ToolArg> for ScanTool {
    fn from(tool: ToolArg) -> Self {
        match tool {
            ToolArg::Trivy => ScanTool::Trivy,
            ToolArg::Sonarqube => ScanTool::Sonarqube,
        }
    }
}

fn parse_conclusion(raw: &str) -> Result<BuildConclusion> {
    match raw {
        "success" => Ok(BuildConclusion::Success),
        "failure" => Ok(BuildConclusion::Failure),
        "cancelled" => Ok(BuildConclusion::Cancelled),
        "timed_out" => Ok(BuildConclusion::TimedOut),
        "action_required" => Ok(BuildConclusion::ActionRequired),
        "skipped" => Ok(BuildConclusion::Skipped),
        "neutral" => Ok(BuildConclusion::Neutral),
        other => anyhow::bail!("unknown conclusion '{other}'"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let store = Arc::new(
        SurrealStore::from_env()
            .await
            .context("failed to connect to the build-risk database")?,
    );

    match cli.command {
        Commands::Repo { action } => match action {
            RepoAction::Register { full_name, external_repo_id, private, branch, language } => {
                cmd_repo_register(&store, full_name, external_repo_id, private, branch, language)
                    .await
            }
        },
        Commands::Build { action } => match action {
            BuildAction::Register {
                raw_repo_id,
                ci_run_id,
                provider,
                commit_sha,
                branch,
                bot_commit,
                conclusion,
                logs_available,
            } => {
                cmd_build_register(
                    &store,
                    raw_repo_id,
                    ci_run_id,
                    provider,
                    commit_sha,
                    branch,
                    bot_commit,
                    conclusion,
                    logs_available,
                )
                .await
            }
        },
        Commands::Scenario { action } => match action {
            ScenarioAction::Create { owner_id, name, yaml_path } => {
                cmd_scenario_create(&store, owner_id, name, &yaml_path).await
            }
            ScenarioAction::Show { scenario_id } => cmd_scenario_show(&store, scenario_id).await,
        },
        Commands::Run { action } => {
            let orchestrator =
                build_orchestrator(store, &cli.data_root, cli.ci_provider, cli.github_token.as_deref())
                    .await?;
            match action {
                RunAction::Generate { scenario_id } => {
                    orchestrator.start_scenario_generation(scenario_id).await?;
                    println!("scenario generation started for {scenario_id}");
                    Ok(())
                }
                RunAction::Process { scenario_id } => {
                    orchestrator.start_processing(scenario_id).await?;
                    println!("scenario processing started for {scenario_id}");
                    Ok(())
                }
            }
        }
        Commands::Reingest { scenario_id, ingestion_build_id } => {
            let orchestrator =
                build_orchestrator(store, &cli.data_root, cli.ci_provider, cli.github_token.as_deref())
                    .await?;
            orchestrator.reingest_missing_resource(scenario_id, ingestion_build_id).await?;
            println!("reingestion retried for build {ingestion_build_id}");
            Ok(())
        }
        Commands::Scan { action } => {
            let orchestrator =
                build_orchestrator(store, &cli.data_root, cli.ci_provider, cli.github_token.as_deref())
                    .await?;
            match action {
                ScanAction::Retry { scenario_id, raw_repo_id, commit_sha, tool } => {
                    orchestrator
                        .retry_commit_scan(scenario_id, raw_repo_id, &commit_sha, tool.into())
                        .await?;
                    println!("scan retried for {commit_sha}");
                    Ok(())
                }
                ScanAction::SonarWebhook { scenario_id, component_key, metrics_json, feature_vectors } => {
                    let metrics: HashMap<String, f64> = serde_json::from_str(&metrics_json)
                        .context("metrics_json must be a JSON object of string to number")?;
                    orchestrator
                        .on_sonar_analysis_complete(scenario_id, &component_key, &feature_vectors, metrics)
                        .await?;
                    println!("sonar analysis recorded for component {component_key}");
                    Ok(())
                }
            }
        }
    }
}

async fn cmd_repo_register(
    store: &Arc<SurrealStore>,
    full_name: String,
    external_repo_id: String,
    private: bool,
    branch: String,
    language: Option<String>,
) -> Result<()> {
    let repos: Repo<RawRepository> = Repo::new(store.clone(), "raw_repository");
    let mut repo = RawRepository::new(full_name, external_repo_id);
    repo.is_private = private;
    repo.default_branch = branch;
    repo.primary_language = language;
    repos.upsert(repo.id, GLOBAL_SCOPE, &repo).await?;

    info!(repo_id = %repo.id, full_name = %repo.full_name, "registered repository");
    println!("{}", serde_json::to_string_pretty(&repo)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_build_register(
    store: &Arc<SurrealStore>,
    raw_repo_id: Uuid,
    ci_run_id: String,
    provider: String,
    commit_sha: String,
    branch: String,
    bot_commit: bool,
    conclusion: Option<String>,
    logs_available: bool,
) -> Result<()> {
    let builds: Repo<RawBuildRun> = Repo::new(store.clone(), "raw_build_run");
    let mut build = RawBuildRun::new(raw_repo_id, ci_run_id, provider, commit_sha);
    build.branch = branch;
    build.is_bot_commit = bot_commit;
    build.logs_available = logs_available;
    if let Some(raw) = conclusion {
        build.conclusion = Some(parse_conclusion(&raw)?);
    }
    if build.conclusion.is_some() {
        build.started_at = Some(chrono::Utc::now());
        build.completed_at = Some(chrono::Utc::now());
        build.status = "completed".to_string();
    }
    builds.upsert(build.id, GLOBAL_SCOPE, &build).await?;

    info!(build_id = %build.id, raw_repo_id = %raw_repo_id, "registered build run");
    println!("{}", serde_json::to_string_pretty(&build)?);
    Ok(())
}

async fn cmd_scenario_create(
    store: &Arc<SurrealStore>,
    owner_id: Uuid,
    name: String,
    yaml_path: &PathBuf,
) -> Result<()> {
    let raw_yaml = std::fs::read_to_string(yaml_path)
        .with_context(|| format!("failed to read scenario yaml: {yaml_path:?}"))?;
    let scenario = build_scenario(owner_id, name, raw_yaml)?;

    let scenarios: Repo<Scenario> = Repo::new(store.clone(), "scenario");
    scenarios.upsert(scenario.id, scenario.id, &scenario).await?;

    info!(scenario_id = %scenario.id, "scenario created");
    println!("{}", serde_json::to_string_pretty(&scenario)?);
    Ok(())
}

async fn cmd_scenario_show(store: &Arc<SurrealStore>, scenario_id: Uuid) -> Result<()> {
    let scenarios: Repo<Scenario> = Repo::new(store.clone(), "scenario");
    let scenario = scenarios
        .get(scenario_id)
        .await?
        .with_context(|| format!("scenario not found: {scenario_id}"))?;
    println!("{}", serde_json::to_string_pretty(&scenario)?);
    Ok(())
}

/// Assembles a fully-wired `ScenarioOrchestrator` over the given store.
/// Used by every subcommand that actually runs pipeline work (`run`,
/// `reingest`, `scan`) — `repo`/`build`/`scenario` commands only touch
/// their own `Repo<T>` and skip this, since there's no reason to spin up
/// worker pools for a plain inventory write.
async fn build_orchestrator(
    store: Arc<SurrealStore>,
    data_root: &PathBuf,
    ci_provider: CiProviderKind,
    github_token: Option<&str>,
) -> Result<ScenarioOrchestrator> {
    let repos_root = data_root.join("repos");
    let worktrees_root = data_root.join("worktrees");
    let logs_root = data_root.join("logs");
    let output_root = data_root.join("output");
    let scan_config_root = data_root.join("scan-config");

    let scenarios: Arc<Repo<Scenario>> = Arc::new(Repo::new(store.clone(), "scenario"));
    let raw_repositories: Arc<Repo<RawRepository>> = Arc::new(Repo::new(store.clone(), "raw_repository"));
    let raw_build_runs: Arc<Repo<RawBuildRun>> = Arc::new(Repo::new(store.clone(), "raw_build_run"));
    let ingestion_builds: Arc<Repo<IngestionBuild>> = Arc::new(Repo::new(store.clone(), "ingestion_build"));
    let enrichment_builds: Arc<Repo<EnrichmentBuild>> = Arc::new(Repo::new(store.clone(), "enrichment_build"));
    let feature_vectors: Arc<Repo<FeatureVector>> = Arc::new(Repo::new(store.clone(), "feature_vector"));
    let dataset_splits: Arc<Repo<DatasetSplit>> = Arc::new(Repo::new(store.clone(), "dataset_split"));
    let run_pointers: Arc<Repo<RunPointer>> = Arc::new(Repo::new(store.clone(), run_pointer_kind()));
    let sonar_pending: Arc<Repo<SonarScanPending>> = Arc::new(Repo::new(store.clone(), "sonar_scan_pending"));
    let trivy_scans: Arc<Repo<TrivyCommitScan>> = Arc::new(Repo::new(store.clone(), "trivy_commit_scan"));

    let ledger: Arc<dyn PipelineRunLedger> = store.clone();

    let ci_client: Arc<dyn CiProviderClient> = match ci_provider {
        CiProviderKind::Fake => Arc::new(FakeCiProviderClient::new()),
        CiProviderKind::Github => {
            let token = github_token
                .context("--github-token (or GITHUB_TOKEN) is required with --ci-provider=github")?;
            Arc::new(GithubActionsClient::new(token))
        }
    };

    // Snapshot of id -> full_name, used only to replay unreachable fork
    // commits during worktree creation. Computed once per process; a repo
    // registered after this point won't be replayable until the next
    // invocation picks it up.
    let known_repos = raw_repositories.list_by_scenario(GLOBAL_SCOPE).await?;
    let repo_names: HashMap<String, String> =
        known_repos.into_iter().map(|r| (r.id.to_string(), r.full_name)).collect();
    let repo_names = Arc::new(repo_names);
    let full_name_by_repo_id: Arc<dyn Fn(&str) -> Option<String> + Send + Sync> = {
        let repo_names = repo_names.clone();
        Arc::new(move |id: &str| repo_names.get(id).cloned())
    };

    let locks = Arc::new(RepoLockRegistry::new());
    let clone_task = Arc::new(CloneRepoTask::new(locks.clone()));
    let worktrees_task =
        Arc::new(CreateWorktreesBatchTask::new(locks.clone(), ci_client.clone(), full_name_by_repo_id));
    let logs_task = Arc::new(DownloadBuildLogsTask::new(ci_client.clone()));
    let repo_ingestion = Arc::new(RepoIngestionTask::new(clone_task, worktrees_task, logs_task));

    let sonar_client: Arc<dyn ScannerClient> = Arc::new(FakeScannerClient::new());
    let trivy_client: Arc<dyn ScannerClient> = Arc::new(FakeScannerClient::new());
    let scan_dispatcher = Arc::new(ScanDispatcher::new(
        sonar_client,
        trivy_client,
        feature_vectors.clone(),
        sonar_pending,
        trivy_scans,
        scan_config_root,
        ScanBatchConfig::default(),
    ));

    let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());

    let runtime = Arc::new(Runtime::start(&[
        (queue::INGESTION, 4),
        (queue::PROCESSING, 4),
        (queue::SCENARIO_INGESTION, 4),
        (queue::SCENARIO_PROCESSING, 2),
        (queue::SCENARIO_SCANNING, 4),
        (queue::SONAR_SCAN, 2),
        (queue::TRIVY_SCAN, 2),
    ]));

    Ok(ScenarioOrchestrator::new(
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
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_conclusion_accepts_known_values_and_rejects_others() {
        assert_eq!(parse_conclusion("success").unwrap(), BuildConclusion::Success);
        assert_eq!(parse_conclusion("timed_out").unwrap(), BuildConclusion::TimedOut);
        assert!(parse_conclusion("bogus").is_err());
    }

    #[test]
    fn tool_arg_maps_onto_scan_tool() {
        assert_eq!(ScanTool::from(ToolArg::Trivy), ScanTool::Trivy);
        assert_eq!(ScanTool::from(ToolArg::Sonarqube), ScanTool::Sonarqube);
    }
}
