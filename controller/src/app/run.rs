//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::ControlError;
use crate::server::serve::serve;
use crate::server::state::ServerState;

/// Run the control plane until the shutdown signal fires
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ControlError> {
    info!("Initializing spotforge...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let app_state = match AppState::init(version, &options).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to start: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };
    shutdown_manager.with_app_state(app_state.clone())?;

    if let Err(e) = init(&options, app_state, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ControlError> {
    if options.lifecycle.resume_on_start {
        resume_deployment(&app_state).await?;
    }

    init_http_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await
}

async fn resume_deployment(app_state: &AppState) -> Result<(), ControlError> {
    let stage = app_state.orchestrator.stage().await;
    if stage.is_error() {
        info!(
            "Last deployment stopped with error {}, waiting for revive or reclaim",
            stage
        );
        return Ok(());
    }
    if app_state.orchestrator.resume().await? {
        info!("Resumed the unfinished deployment at stage {}", stage);
    }
    Ok(())
}

async fn init_http_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ControlError> {
    info!("Initializing operator HTTP server...");

    let server_state = ServerState::new(app_state.version.clone(), app_state.orchestrator.clone());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_http_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    http_server_handle: Option<JoinHandle<Result<(), ControlError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            http_server_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), ControlError> {
        if self.app_state.is_some() {
            return Err(ControlError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_http_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ControlError>>,
    ) -> Result<(), ControlError> {
        if self.http_server_handle.is_some() {
            return Err(ControlError::ShutdownError("server_handle already set".to_string()));
        }
        self.http_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ControlError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ControlError> {
        info!("Shutting down spotforge...");

        // 1. HTTP server, no new operator requests
        if let Some(handle) = self.http_server_handle.take() {
            handle
                .await
                .map_err(|e| ControlError::ShutdownError(e.to_string()))??;
        }

        // 2. Deployment pipeline
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
