//! Long-running host process for the build-risk dataset platform.
//!
//! Builds the same `ScenarioOrchestrator` the CLI assembles for one-shot
//! invocations, but keeps its Task Runtime worker pools alive for the life
//! of the process and fronts them with an HTTP control surface: triggering
//! scenario generation/processing, retrying a failed resource or scan, and
//! landing the asynchronous SonarQube analysis-complete webhook. A second
//! background task drains the event bus and logs every update, giving an
//! operator a live feed without polling storage.

mod routes;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Level;

use buildrisk_core::domain::{
    DatasetSplit, EnrichmentBuild, FeatureVector, IngestionBuild, RawBuildRun, RawRepository,
    SonarScanPending, TrivyCommitScan,
};
use buildrisk_core::runtime::queue;
use buildrisk_core::{init_tracing, Runtime, Scenario};
use buildrisk_orchestrator::{
    run_pointer_kind, BroadcastEventBus, CiProviderClient, CloneRepoTask,
    CreateWorktreesBatchTask, DownloadBuildLogsTask, EventBus, FakeCiProviderClient,
    FakeScannerClient, GithubActionsClient, RepoIngestionTask, RepoLockRegistry, Repo,
    RunPointer, ScanBatchConfig, ScanDispatcher, ScannerClient, ScenarioOrchestrator,
};
use buildrisk_state::{PipelineRunLedger, SurrealStore, GLOBAL_SCOPE};

#[derive(Parser)]
#[command(name = "buildriskd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build-risk dataset platform daemon", long_about = None)]
struct Args {
    /// Enable verbose (debug-level) logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "BUILDRISK_LOG_JSON")]
    json: bool,

    /// Root directory for clones, worktrees, downloaded logs and exports
    #[arg(long, default_value = ".buildrisk-data", env = "BUILDRISK_DATA_ROOT")]
    data_root: PathBuf,

    /// Address the HTTP control surface binds to
    #[arg(long, default_value = "0.0.0.0:8080", env = "BUILDRISK_BIND_ADDR")]
    bind_addr: String,

    /// Use the real GitHub Actions client instead of the in-memory fake
    #[arg(long, env = "BUILDRISK_CI_PROVIDER_GITHUB")]
    github: bool,

    /// GitHub token, required when --github is set
    #[arg(long, env = "GITHUB_TOKEN")]
    github_token: Option<String>,
}

struct AppState {
    orchestrator: Arc<ScenarioOrchestrator>,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(args.json, level);

    let store = Arc::new(
        SurrealStore::from_env()
            .await
            .context("failed to connect to the build-risk database")?,
    );

    let (orchestrator, events) = build_orchestrator(
        store,
        &args.data_root,
        args.github,
        args.github_token.as_deref(),
    )
    .await?;
    let orchestrator = Arc::new(orchestrator);

    tokio::spawn(log_events(events));

    let state = Arc::new(AppState { orchestrator, started_at: Instant::now() });

    let app = Router::new()
        .route("/healthz", get(routes::health))
        .route("/scenarios/:scenario_id/generate", post(routes::generate))
        .route("/scenarios/:scenario_id/process", post(routes::process))
        .route("/scenarios/:scenario_id/reingest", post(routes::reingest))
        .route("/scenarios/:scenario_id/scans/retry", post(routes::retry_scan))
        .route("/scenarios/:scenario_id/webhooks/sonar", post(routes::sonar_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!(addr = %args.bind_addr, "buildriskd listening");
    let listener = tokio::net::TcpListener::bind(&args.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Drains the event bus and logs every update at info level. Lossy by
/// design: a lagged subscriber skips ahead rather than blocking the
/// orchestrator's publishers, matching `BroadcastEventBus`'s semantics.
async fn log_events(events: Arc<dyn EventBus>) {
    let mut stream = events.subscribe();
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                tracing::info!(
                    topic = ?event.topic,
                    scenario_id = ?event.scenario_id,
                    entity_id = %event.entity_id,
                    "event"
                );
            }
            Err(err) => tracing::warn!(error = %err, "event subscriber lagged"),
        }
    }
}

/// Assembles a fully-wired `ScenarioOrchestrator`, mirroring the CLI's own
/// assembly function. Returns the event bus alongside it so the caller can
/// subscribe before the orchestrator starts publishing.
async fn build_orchestrator(
    store: Arc<SurrealStore>,
    data_root: &PathBuf,
    github: bool,
    github_token: Option<&str>,
) -> anyhow::Result<(ScenarioOrchestrator, Arc<dyn EventBus>)> {
    let repos_root = data_root.join("repos");
    let worktrees_root = data_root.join("worktrees");
    let logs_root = data_root.join("logs");
    let output_root = data_root.join("output");
    let scan_config_root = data_root.join("scan-config");

    let scenarios: Arc<Repo<Scenario>> = Arc::new(Repo::new(store.clone(), "scenario"));
    let raw_repositories: Arc<Repo<RawRepository>> =
        Arc::new(Repo::new(store.clone(), "raw_repository"));
    let raw_build_runs: Arc<Repo<RawBuildRun>> = Arc::new(Repo::new(store.clone(), "raw_build_run"));
    let ingestion_builds: Arc<Repo<IngestionBuild>> =
        Arc::new(Repo::new(store.clone(), "ingestion_build"));
    let enrichment_builds: Arc<Repo<EnrichmentBuild>> =
        Arc::new(Repo::new(store.clone(), "enrichment_build"));
    let feature_vectors: Arc<Repo<FeatureVector>> = Arc::new(Repo::new(store.clone(), "feature_vector"));
    let dataset_splits: Arc<Repo<DatasetSplit>> = Arc::new(Repo::new(store.clone(), "dataset_split"));
    let run_pointers: Arc<Repo<RunPointer>> = Arc::new(Repo::new(store.clone(), run_pointer_kind()));
    let sonar_pending: Arc<Repo<SonarScanPending>> =
        Arc::new(Repo::new(store.clone(), "sonar_scan_pending"));
    let trivy_scans: Arc<Repo<TrivyCommitScan>> = Arc::new(Repo::new(store.clone(), "trivy_commit_scan"));

    let ledger: Arc<dyn PipelineRunLedger> = store.clone();

    let ci_client: Arc<dyn CiProviderClient> = if github {
        let token = github_token
            .context("--github-token (or GITHUB_TOKEN) is required with --github")?;
        Arc::new(GithubActionsClient::new(token))
    } else {
        Arc::new(FakeCiProviderClient::new())
    };

    // Snapshot of id -> full_name, rebuilt once at process startup. A repo
    // registered after this point won't be replayable during worktree
    // creation until the daemon restarts.
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

    let orchestrator = ScenarioOrchestrator::new(
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
        events.clone(),
        repos_root,
        worktrees_root,
        logs_root,
        output_root,
    );

    Ok((orchestrator, events))
}

#[cfg(test)]
mod tests {
    #[test]
    fn buildriskd_smoke_compiles() {
        // Compile-time check: main exists and returns Result.
        let _: fn() -> anyhow::Result<()> = super::main;
    }
}
