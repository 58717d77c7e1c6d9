//! Application state management

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;

use crate::app::options::AppOptions;
use crate::cloud::gateway::GatewayClient;
use crate::cloud::CloudClient;
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::ControlError;
use crate::events::Observers;
use crate::transport::openssh::OpenSshTransport;
use crate::transport::Transport;

/// Main application state
pub struct AppState {
    /// Version of the running binary
    pub version: String,

    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(version: String, options: &AppOptions) -> Result<Self, ControlError> {
        info!("Initializing application state...");

        if options.cloud.gateway_url.is_empty() {
            return Err(ControlError::ConfigError(
                "cloud.gateway_url is not set".to_string(),
            ));
        }
        let cloud: Arc<dyn CloudClient> = Arc::new(GatewayClient::new(
            &options.cloud.gateway_url,
            options.cloud.gateway_token.clone().map(SecretString::from),
            options.cloud.project_id,
            options.cloud.policy.clone(),
        )?);
        let transport: Arc<dyn Transport> = Arc::new(OpenSshTransport::new(options.ssh.clone()));

        Self::with_clients(version, options, cloud, transport).await
    }

    /// Build the state around the given clients
    pub async fn with_clients(
        version: String,
        options: &AppOptions,
        cloud: Arc<dyn CloudClient>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ControlError> {
        let orchestrator = Orchestrator::open(
            options.layout.clone(),
            options.orchestrator.clone(),
            cloud,
            transport,
            Observers::with_logging(options.forward_agent_logs),
        )
        .await?;

        Ok(Self {
            version,
            orchestrator,
        })
    }

    /// Shutdown application state
    ///
    /// Supervision stops without cleaning up, the persisted stage is resumed
    /// on the next start.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        info!("Shutting down application state...");
        self.orchestrator.shutdown().await;
        Ok(())
    }
}
