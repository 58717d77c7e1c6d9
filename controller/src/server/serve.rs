//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ControlError;
use crate::server::handlers::{
    backups_handler, command_handler, commands_handler, discard_backup_handler, health_handler,
    instance_handler, kill_handler, launch_handler, maintenance_handler, reclaim_handler,
    restore_launch_handler, revive_handler, status_handler, stop_handler, version_handler,
    workload_handler,
};
use crate::server::state::ServerState;

/// Operator routes
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Queries
        .route("/status", get(status_handler))
        .route("/instance", get(instance_handler))
        .route("/workload", get(workload_handler))
        .route("/server/commands", get(commands_handler))
        .route("/server/backups", get(backups_handler))
        // Operations
        .route("/server/launch", post(launch_handler))
        .route("/server/maintenance", post(maintenance_handler))
        .route("/server/restorelaunch", post(restore_launch_handler))
        .route("/server/discardbackup", post(discard_backup_handler))
        .route("/server/revive", post(revive_handler))
        .route("/server/reclaim", post(reclaim_handler))
        .route("/server/stop", post(stop_handler))
        .route("/server/kill", post(kill_handler))
        .route("/server/command", post(command_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ControlError>>, ControlError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ControlError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ControlError::ServerError(e.to_string()))
    });

    Ok(handle)
}
