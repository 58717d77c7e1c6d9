//! Cloud capability client

pub mod filter;
pub mod gateway;

use async_trait::async_trait;
use cloud_api::{InstanceConfig, InstanceInfo, KeyPair, KeyPairInfo};
use thiserror::Error;

/// Errors returned by a [`CloudClient`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CloudError {
    /// The resource does not exist (any more)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider refused the request
    #[error("Provider error {code}: {message}")]
    Provider { code: String, message: String },

    #[error("Unexpected cloud error: {0}")]
    Unexpected(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

/// Operations the control plane needs from the cloud provider
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Instance configurations the deployment may use, unranked
    async fn list_eligible_instance_configs(&self) -> Result<Vec<InstanceConfig>, CloudError>;

    async fn create_key_pair(&self) -> Result<KeyPair, CloudError>;

    async fn delete_key_pair(&self, key_id: &str) -> Result<(), CloudError>;

    async fn describe_key_pair(&self, key_id: &str) -> Result<KeyPairInfo, CloudError>;

    /// Returns the id of the new instance
    async fn create_instance(
        &self,
        config: &InstanceConfig,
        key_id: &str,
    ) -> Result<String, CloudError>;

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceInfo, CloudError>;

    /// Every instance in the project scope
    async fn describe_instances(&self) -> Result<Vec<InstanceInfo>, CloudError>;

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), CloudError>;

    /// Whether the provider is about to reclaim the spot instance
    async fn check_imminent_termination(&self, instance_id: &str) -> Result<bool, CloudError>;
}
