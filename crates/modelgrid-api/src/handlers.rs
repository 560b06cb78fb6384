//! HTTP handlers.
//!
//! Deploys and undeploys run on a spawned task holding their lock, so a
//! dropped connection stops the wait but never the workflow.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use modelgrid_core::{BackendKind, ServeArgs};
use modelgrid_rollout::{DeployError, DeployRequest, UndeployRequest};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Log tail of the instance that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    intervention_required: bool,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            logs: None,
            intervention_required: false,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            logs: None,
            intervention_required: false,
        }),
    )
        .into_response()
}

/// HTTP status of a failed workflow.
pub fn status_for(err: &DeployError) -> StatusCode {
    match err {
        DeployError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        DeployError::ModelNotFound { .. } | DeployError::NotFound { .. } => StatusCode::NOT_FOUND,
        DeployError::PortInUse { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn deploy_error_response(err: &DeployError) -> Response {
    (
        status_for(err),
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
            logs: err.logs().map(str::to_string),
            intervention_required: err.needs_intervention(),
        }),
    )
        .into_response()
}

fn unconfigured(backend: BackendKind) -> Response {
    error_response(&format!("backend {backend} is not configured"), StatusCode::BAD_REQUEST)
}

fn default_backend() -> BackendKind {
    BackendKind::Container
}

/// Body of `POST /start`.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default)]
    pub args: ServeArgs,
    #[serde(default)]
    pub batch_prediction: bool,
    #[serde(default)]
    pub job: Option<serde_json::Value>,
}

/// Body of `POST /stop`.
#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Remove the scheduled jobs of the removed instances.
    #[serde(default)]
    pub batch_prediction: bool,
    /// Accepted for symmetry with `/start`; jobs are found by deployment name.
    #[serde(default)]
    pub job: Option<serde_json::Value>,
}

// ── Workflows ──────────────────────────────────────────────────

/// POST /start
pub async fn start(State(state): State<ApiState>, Json(req): Json<StartRequest>) -> Response {
    let Some(coordinator) = state.coordinator(req.backend) else {
        return unconfigured(req.backend);
    };
    let identity = match coordinator.identity(&req.name, &req.stage, &req.version, None) {
        Ok(identity) => identity,
        Err(e) => return deploy_error_response(&e),
    };

    // Jobs are only registered for batch deployments.
    let job = if req.batch_prediction { req.job } else { None };
    let request = DeployRequest {
        name: req.name,
        version: req.version,
        stage: req.stage,
        args: req.args,
        batch_prediction: req.batch_prediction,
        job,
        suffix: None,
    };

    info!(
        model = %identity.name_clean,
        stage = %identity.stage_clean,
        backend = %req.backend,
        "deploy requested"
    );
    let locks = state.locks.clone();
    let task = tokio::spawn(async move {
        let _slot = locks.lock_slot(&identity.name_clean, &identity.stage_clean).await;
        coordinator.deploy(&request).await
    });

    match task.await {
        Ok(Ok(report)) => ApiResponse::ok(report).into_response(),
        Ok(Err(e)) => deploy_error_response(&e),
        Err(e) => {
            error!(error = %e, "deploy task panicked");
            error_response("deploy task failed", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /stop
pub async fn stop(State(state): State<ApiState>, Json(req): Json<StopRequest>) -> Response {
    let Some(coordinator) = state.coordinator(req.backend) else {
        return unconfigured(req.backend);
    };
    let identity = match coordinator.identity(&req.name, &req.stage, &req.version, None) {
        Ok(identity) => identity,
        Err(e) => return deploy_error_response(&e),
    };

    let request = UndeployRequest {
        name: req.name,
        version: req.version,
        stage: req.stage,
        batch_prediction: req.batch_prediction,
    };

    info!(
        model = %identity.name_clean,
        version = %request.version,
        backend = %req.backend,
        "undeploy requested"
    );
    let locks = state.locks.clone();
    let task = tokio::spawn(async move {
        // Undeploy spans every stage of the model.
        let _model = locks.lock_model(&identity.name_clean).await;
        coordinator.undeploy(&request).await
    });

    match task.await {
        Ok(Ok(report)) => ApiResponse::ok(report).into_response(),
        Ok(Err(e)) => {
            if matches!(e, DeployError::NotFound { .. }) {
                warn!(error = %e, "nothing to undeploy");
            }
            deploy_error_response(&e)
        }
        Err(e) => {
            error!(error = %e, "undeploy task panicked");
            error_response("undeploy task failed", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ── Listing ────────────────────────────────────────────────────

/// GET /running
pub async fn running(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.aggregator.list_running().await).into_response()
}

/// GET /healthz
pub async fn healthz() -> Response {
    ApiResponse::ok("ok").into_response()
}
