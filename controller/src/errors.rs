//! Error types for the control plane

use thiserror::Error;

use crate::cloud::CloudError;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Cloud error: {0}")]
    CloudError(#[from] CloudError),

    #[error("No available instance: {0}")]
    CapacityError(String),

    #[error("Provisioning error: {0}")]
    ProvisionError(String),

    #[error("Bootstrap error: {0}")]
    BootstrapError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("No agent connection became available within {0:?}")]
    ChannelUnavailable(std::time::Duration),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] agent_protocol::ProtocolError),

    #[error("Agent reported: {0}")]
    AgentError(String),

    #[error("Reclaim error: {0}")]
    ReclaimError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Server already launched")]
    AlreadyLaunched,

    #[error("Error exists, unable to launch the server")]
    ErrorPending,

    #[error(
        "Incremental backups exist, use restorelaunch to restore them or discardbackup to drop them"
    )]
    BackupPending,

    #[error("Server is not running")]
    NotRunning,

    #[error("Nothing to revive")]
    NothingToRevive,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Internal(err.to_string())
    }
}

/// Why a pipeline stage stopped early
///
/// `Silent` is a deliberate stop (resume rollback, reclaim) and is never
/// recorded in the status ledger.
#[derive(Debug)]
pub enum Interrupt {
    Silent,
    Failed(ControlError),
}

impl<E: Into<ControlError>> From<E> for Interrupt {
    fn from(err: E) -> Self {
        Interrupt::Failed(err.into())
    }
}

/// Result of a pipeline stage
pub type StageResult<T> = Result<T, Interrupt>;
