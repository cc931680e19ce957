use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::alerts::AlertKind;
use crate::controller::JobController;
use crate::job::{JobKind, JobSpec};
use crate::slots::SlotManager;

#[derive(Clone)]
pub struct DashboardState {
    pub manager: SlotManager,
    pub controller: JobController,
}

#[derive(Serialize)]
struct LocationResponse {
    id: String,
    enabled: bool,
    medium_name: String,
    medium_index: i32,
    session_count: usize,
    disk_usage: i64,
    disk_limit: i64,
    error: Option<String>,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    command: String,
    state: String,
    slot_index: Option<usize>,
    exit_code: Option<i32>,
    output: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    command: String,
    #[serde(default = "default_cpu")]
    cpu: f64,
    #[serde(default)]
    disk_space: i64,
    #[serde(default)]
    medium_index: Option<i32>,
    #[serde(default)]
    gpu_requested: bool,
    #[serde(default)]
    allow_cpu_idle_policy: bool,
}

fn default_cpu() -> f64 {
    1.0
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResetAlertRequest {
    alert: AlertKind,
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/locations", get(locations_handler))
        .route("/api/disk_resources", get(disk_resources_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/alerts/reset", post(reset_alert_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn state_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.manager.build_orchid())
}

async fn locations_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let locations: Vec<LocationResponse> = state
        .manager
        .get_locations()
        .into_iter()
        .map(|location| {
            let resources = location.disk_resources();
            let descriptor = location.medium_descriptor();
            LocationResponse {
                id: location.id().to_string(),
                enabled: location.is_enabled(),
                medium_name: location.medium_name().to_string(),
                medium_index: descriptor.index,
                session_count: location.session_count(),
                disk_usage: resources.usage,
                disk_limit: resources.limit,
                error: location.error().map(|e| e.to_string()),
            }
        })
        .collect();

    Json(locations)
}

async fn disk_resources_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.manager.get_disk_resources())
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .controller
        .all_jobs()
        .into_iter()
        .map(|record| JobResponse {
            id: record.spec.id.to_string(),
            command: record.spec.command.clone(),
            state: record.state.to_string(),
            slot_index: record.slot_index,
            exit_code: record.exit_code,
            output: record.output.clone(),
            error: record.error.clone(),
        })
        .collect();

    Json(jobs)
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let mut spec = JobSpec::new(payload.command);
    spec.kind = JobKind::Scheduler;
    spec.cpu = payload.cpu;
    spec.disk_space = payload.disk_space;
    spec.medium_index = payload.medium_index;
    spec.gpu_requested = payload.gpu_requested;
    spec.allow_cpu_idle_policy = payload.allow_cpu_idle_policy;

    match state.controller.submit(spec) {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id.to_string()),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SubmitJobResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

async fn reset_alert_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<ResetAlertRequest>,
) -> impl IntoResponse {
    if !payload.alert.is_resettable() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": format!("Alert {} is not resettable", payload.alert),
            })),
        );
    }

    state.manager.reset_alert(payload.alert);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "success": true })),
    )
}
