//! Thin HTTP surface (§6). Routing/CORS/request-shape concerns live here;
//! only the handful of commands issued into the engine are specified by
//! the component design (§1's explicit non-goal).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use scan_orchestrator::config::{EngineConfig, HitlDecision};
use scan_orchestrator::registry::ScanRegistry;
use scan_orchestrator::state::ScanState;
use scan_orchestrator::subgraphs::orchestrator::{run_scan, EngineContext};
use scan_orchestrator::types::Phase;

#[derive(Clone)]
struct AppState {
    ctx: Arc<EngineContext>,
    registry: ScanRegistry,
}

#[derive(Deserialize)]
struct StartScanRequest {
    repo_url: String,
    project_id: String,
    github_token: Option<String>,
}

#[derive(Serialize)]
struct StartScanResponse {
    scan_id: String,
    status: &'static str,
}

#[derive(Deserialize)]
struct HitlDecisionRequest {
    decision: String,
    #[allow(dead_code)]
    actor: Option<String>,
    #[allow(dead_code)]
    reason: Option<String>,
}

fn status_label(state: &ScanState) -> &'static str {
    if matches!(state.phase, Phase::Error) || !state.errors.is_empty() {
        "failed"
    } else if matches!(state.phase, Phase::Completed) {
        "completed"
    } else {
        "running"
    }
}

fn progress_messages(state: &ScanState) -> Vec<&'static str> {
    let mut messages = vec!["Scan started"];
    if !matches!(state.phase, Phase::MasterOrchestrator | Phase::Validation) {
        messages.push("Validation and setup running");
    }
    match status_label(state) {
        "completed" => messages.push("Scan completed"),
        "failed" => messages.push("Scan failed"),
        _ => {}
    }
    messages
}

async fn start_scan(State(app): State<AppState>, Json(req): Json<StartScanRequest>) -> impl IntoResponse {
    let scan_id = uuid::Uuid::new_v4().to_string();
    let ctx = app.ctx.clone();
    let registry = app.registry.clone();
    let repo_url = req.repo_url.clone();
    let project_id = req.project_id.clone();
    let token = req.github_token.clone();

    let handle = tokio::spawn(async move {
        let _ = run_scan(&ctx, &registry, &repo_url, &project_id, token).await;
    });

    app.registry.track_task(&scan_id, handle).await;

    (StatusCode::ACCEPTED, Json(StartScanResponse { scan_id, status: "started" }))
}

async fn scan_status(State(app): State<AppState>, Path(scan_id): Path<String>) -> impl IntoResponse {
    match app.registry.get(&scan_id).await {
        Some(handle) => {
            let state = &handle.latest_state;
            Json(json!({
                "status": status_label(state),
                "current_phase": state.phase.to_string(),
                "messages": progress_messages(state),
                "errors": state.errors,
            }))
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "scan not found"}))).into_response(),
    }
}

async fn scan_results(State(app): State<AppState>, Path(scan_id): Path<String>) -> impl IntoResponse {
    match app.registry.get(&scan_id).await {
        Some(handle) => {
            let stripped = handle.latest_state.with_token_stripped();
            Json(json!({
                "scan_id": scan_id,
                "status": status_label(&stripped),
                "state": stripped,
            }))
            .into_response()
        }
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "scan not found"}))).into_response(),
    }
}

async fn submit_hitl_decision(
    State(app): State<AppState>,
    Path(scan_id): Path<String>,
    Json(req): Json<HitlDecisionRequest>,
) -> impl IntoResponse {
    match HitlDecision::parse(&req.decision) {
        Some(decision) => {
            app.registry.submit_decision(&scan_id, decision).await;
            Json(json!({"scan_id": scan_id, "accepted": true, "decision": decision.as_str()})).into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({"scan_id": scan_id, "accepted": false, "error": "decision must be 'approve' or 'reject'"})),
        )
            .into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/scan/start", post(start_scan))
        .route("/scan/{scan_id}/status", get(scan_status))
        .route("/scan/{scan_id}/results", get(scan_results))
        .route("/scan/{scan_id}/hitl-decision", post(submit_hitl_decision))
        .route("/health", get(health))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    scan_orchestrator::telemetry::init_tracing(&config.log_level);

    let ctx = Arc::new(EngineContext::new(config).await?);
    let registry = ScanRegistry::new();
    let app = router(AppState { ctx, registry });

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    tracing::info!("scan-server listening on 0.0.0.0:8080");
    axum::serve(listener, app).await?;
    Ok(())
}
