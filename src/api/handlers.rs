use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::protocol::*;
use crate::builds::tracker::BuildJobTracker;
use crate::builds::types::BuildJobDescriptor;
use crate::control::ChaosController;
use crate::error::CoordinatorError;

/// Shared state behind the operator API.
pub struct ApiState {
    pub tracker: Arc<BuildJobTracker>,
    pub controller: Arc<ChaosController>,
}

impl ApiState {
    pub fn new(tracker: Arc<BuildJobTracker>, controller: Arc<ChaosController>) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            controller,
        })
    }
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route(ENDPOINT_BUILDS, post(handle_enqueue))
        .route(ENDPOINT_BUILDS_QUEUED, get(handle_queued_builds))
        .route(ENDPOINT_BUILDS_RUNNING, get(handle_running_builds))
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_AGENT_KILL, post(handle_kill_agent))
        .route(ENDPOINT_AGENT_PAUSE, post(handle_pause_agent))
        .route(ENDPOINT_AGENT_RESUME, post(handle_resume_agent))
        .route(ENDPOINT_AGENTS_SHUTDOWN, post(handle_shutdown_agents))
        .route(ENDPOINT_AGENTS_KILL_RANDOM, post(handle_kill_random_agent))
        .layer(Extension(state))
}

fn status_for(err: &CoordinatorError) -> StatusCode {
    match err {
        CoordinatorError::StoreUnavailable(_) | CoordinatorError::LockTimeout { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoordinatorError::Config(_) | CoordinatorError::Protocol(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn handle_enqueue(
    Extension(state): Extension<Arc<ApiState>>,
    Json(descriptor): Json<BuildJobDescriptor>,
) -> (StatusCode, Json<EnqueueResponse>) {
    match state.tracker.enqueue(&descriptor).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(EnqueueResponse {
                accepted: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::error!("Failed to enqueue build: {}", e);
            (
                status_for(&e),
                Json(EnqueueResponse {
                    accepted: false,
                    job_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_queued_builds(
    Extension(state): Extension<Arc<ApiState>>,
) -> Result<Json<JobsResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .tracker
        .queued_jobs()
        .await
        .map(|jobs| Json(JobsResponse { jobs }))
        .map_err(error_response)
}

pub async fn handle_running_builds(
    Extension(state): Extension<Arc<ApiState>>,
) -> Result<Json<JobsResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .tracker
        .running_jobs()
        .await
        .map(|jobs| Json(JobsResponse { jobs }))
        .map_err(error_response)
}

pub async fn handle_stats(
    Extension(state): Extension<Arc<ApiState>>,
) -> Result<Json<StatsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let stats = async {
        Ok::<_, CoordinatorError>(StatsResponse {
            queue_depth: state.tracker.queue_depth().await?,
            in_flight: state.tracker.in_flight_count().await?,
            busy_agents: state.controller.busy_agents().await?,
        })
    };
    stats.await.map(Json).map_err(error_response)
}

pub async fn handle_kill_agent(
    Extension(state): Extension<Arc<ApiState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ControlResponse>) {
    let result = state.controller.trigger_kill_agent(&name).await;
    control_response(Some(name), result)
}

pub async fn handle_pause_agent(
    Extension(state): Extension<Arc<ApiState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ControlResponse>) {
    let result = state.controller.pause_agent(&name).await;
    control_response(Some(name), result)
}

pub async fn handle_resume_agent(
    Extension(state): Extension<Arc<ApiState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ControlResponse>) {
    let result = state.controller.resume_agent(&name).await;
    control_response(Some(name), result)
}

pub async fn handle_shutdown_agents(
    Extension(state): Extension<Arc<ApiState>>,
) -> (StatusCode, Json<ControlResponse>) {
    let result = state.controller.shutdown_all_agents().await;
    control_response(None, result)
}

pub async fn handle_kill_random_agent(
    Extension(state): Extension<Arc<ApiState>>,
) -> (StatusCode, Json<ControlResponse>) {
    match state.controller.kill_random_agent().await {
        Ok(Some(agent)) => control_response(Some(agent), Ok(())),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ControlResponse {
                success: false,
                agent: None,
                error: Some("no busy agent to kill".to_string()),
            }),
        ),
        Err(e) => control_response(None, Err(e)),
    }
}

fn control_response(
    agent: Option<String>,
    result: crate::error::Result<()>,
) -> (StatusCode, Json<ControlResponse>) {
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(ControlResponse {
                success: true,
                agent,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Control request failed: {}", e);
            (
                status_for(&e),
                Json(ControlResponse {
                    success: false,
                    agent,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

fn error_response(err: CoordinatorError) -> (StatusCode, Json<ErrorResponse>) {
    tracing::error!("Read request failed: {}", err);
    (
        status_for(&err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
