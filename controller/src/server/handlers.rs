//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::deploy::bootstrap::{DeploymentOptions, RestoreChoice};
use crate::deploy::cleanup::CleanupOutcome;
use crate::deploy::orchestrator::CommandOutcome;
use crate::errors::ControlError;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Body of every operation response
#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
}

impl OperationResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

/// A rejected operation
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::AlreadyLaunched
            | ControlError::ErrorPending
            | ControlError::BackupPending
            | ControlError::NotRunning
            | ControlError::NothingToRevive => StatusCode::CONFLICT,
            ControlError::ChannelUnavailable(_) | ControlError::ChannelError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Operation failed: {}", self.0);
        }
        let body = OperationResponse {
            success: false,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "spotforge".to_string(),
        version: state.version.clone(),
    })
}

pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Deployment status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub stage_code: u32,
    pub message: String,
    pub last_error: String,
    pub running: bool,
}

pub async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let record = state.orchestrator.status().await;
    Json(StatusResponse {
        stage_code: record.stage_code.code(),
        message: record.message,
        last_error: record.last_error,
        running: state.orchestrator.is_running().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
}

pub async fn instance_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<Json<Value>> {
    let value = state
        .orchestrator
        .instance_detail(query.key.as_deref())
        .await?;
    Ok(Json(value.unwrap_or(Value::Null)))
}

pub async fn workload_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<Json<Value>> {
    let value = state
        .orchestrator
        .workload_info(query.key.as_deref())
        .await?;
    Ok(Json(value.unwrap_or(Value::Null)))
}

pub async fn commands_handler(State(state): State<Arc<ServerState>>) -> ApiResult<Json<Value>> {
    let commands = state.orchestrator.pending_commands().await?;
    Ok(Json(serde_json::json!({ "commands": commands })))
}

pub async fn backups_handler(State(state): State<Arc<ServerState>>) -> ApiResult<Json<Value>> {
    let backups = state.orchestrator.backup_records().await?;
    Ok(Json(serde_json::json!({ "backups": backups })))
}

async fn launch_with(
    state: &ServerState,
    options: DeploymentOptions,
) -> ApiResult<Json<OperationResponse>> {
    state.orchestrator.launch(options).await?;
    Ok(OperationResponse::ok("Launching"))
}

pub async fn launch_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<OperationResponse>> {
    launch_with(&state, DeploymentOptions::default()).await
}

pub async fn maintenance_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<OperationResponse>> {
    let options = DeploymentOptions {
        maintenance: true,
        ..Default::default()
    };
    launch_with(&state, options).await
}

pub async fn restore_launch_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<OperationResponse>> {
    let options = DeploymentOptions {
        restore_backup: RestoreChoice::Restore,
        ..Default::default()
    };
    launch_with(&state, options).await
}

pub async fn discard_backup_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<OperationResponse>> {
    let options = DeploymentOptions {
        restore_backup: RestoreChoice::Discard,
        ..Default::default()
    };
    launch_with(&state, options).await
}

pub async fn revive_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<OperationResponse>> {
    let stage = state.orchestrator.revive().await?;
    Ok(OperationResponse::ok(format!("Revived to stage {}", stage)))
}

/// Reclaim runs in the background, it may wait minutes on the provider
pub async fn reclaim_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.reclaim().await {
            Ok(CleanupOutcome::Cleaned) => info!("Reclaim finished"),
            Ok(CleanupOutcome::AlreadyCleaning) => info!("Reclaim joined a running cleanup"),
            Err(e) => error!("Reclaim failed: {}", e),
        }
    });
    (StatusCode::ACCEPTED, OperationResponse::ok("Reclaiming"))
}

pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<OperationResponse>> {
    state.orchestrator.stop(false).await?;
    Ok(OperationResponse::ok("Stopping"))
}

pub async fn kill_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<OperationResponse>> {
    state.orchestrator.stop(true).await?;
    Ok(OperationResponse::ok("Killing"))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

pub async fn command_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<Json<OperationResponse>> {
    let message = match state.orchestrator.send_command(&request.command).await? {
        CommandOutcome::Sent => "Sent",
        CommandOutcome::Queued => "Queued until the server is running",
    };
    Ok(OperationResponse::ok(message))
}
