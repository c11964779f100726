//! HTTP handlers for the daemon's control surface and webhook landing point.
//!
//! Every handler borrows the shared `ScenarioOrchestrator` out of `AppState`
//! and is otherwise a thin translation from JSON to one of its async
//! methods; the orchestrator itself remains the source of truth for what is
//! and isn't allowed (e.g. `start_processing` on a scenario that was never
//! generated still returns its own domain error, which we surface as 422).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use buildrisk_core::domain::ScanTool;

use crate::AppState;

pub(crate) fn orchestrator_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    tracing::warn!(error = %e, "orchestrator call failed");
    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": e.to_string() })))
}

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.started_at.elapsed().as_secs(),
    }))
}

pub(crate) async fn generate(
    State(state): State<Arc<AppState>>,
    Path(scenario_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    state
        .orchestrator
        .start_scenario_generation(scenario_id)
        .await
        .map_err(orchestrator_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "scenario_id": scenario_id, "phase": "generate" }))))
}

pub(crate) async fn process(
    State(state): State<Arc<AppState>>,
    Path(scenario_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    state
        .orchestrator
        .start_processing(scenario_id)
        .await
        .map_err(orchestrator_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "scenario_id": scenario_id, "phase": "process" }))))
}

#[derive(Deserialize)]
pub(crate) struct ReingestBody {
    ingestion_build_id: Uuid,
}

pub(crate) async fn reingest(
    State(state): State<Arc<AppState>>,
    Path(scenario_id): Path<Uuid>,
    Json(body): Json<ReingestBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    state
        .orchestrator
        .reingest_missing_resource(scenario_id, body.ingestion_build_id)
        .await
        .map_err(orchestrator_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "ingestion_build_id": body.ingestion_build_id }))))
}

#[derive(Deserialize)]
pub(crate) struct RetryScanBody {
    raw_repo_id: Uuid,
    commit_sha: String,
    tool: ScanTool,
}

pub(crate) async fn retry_scan(
    State(state): State<Arc<AppState>>,
    Path(scenario_id): Path<Uuid>,
    Json(body): Json<RetryScanBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    state
        .orchestrator
        .retry_commit_scan(scenario_id, body.raw_repo_id, &body.commit_sha, body.tool)
        .await
        .map_err(orchestrator_error)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "commit_sha": body.commit_sha }))))
}

#[derive(Deserialize)]
pub(crate) struct SonarWebhookBody {
    component_key: String,
    feature_vector_ids: Vec<Uuid>,
    metrics: HashMap<String, f64>,
}

pub(crate) async fn sonar_webhook(
    State(state): State<Arc<AppState>>,
    Path(scenario_id): Path<Uuid>,
    Json(body): Json<SonarWebhookBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    state
        .orchestrator
        .on_sonar_analysis_complete(
            scenario_id,
            &body.component_key,
            &body.feature_vector_ids,
            body.metrics,
        )
        .await
        .map_err(orchestrator_error)?;
    Ok((StatusCode::OK, Json(json!({ "component_key": body.component_key }))))
}
