//! Cloud API models

use serde::{Deserialize, Serialize};

/// Price information attached to an instance type quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PriceInfo {
    /// Discounted unit price (spot price)
    pub unit_price_discount: f64,

    /// Billing unit, e.g. "HOUR"
    #[serde(default)]
    pub charge_unit: String,
}

/// An instance configuration offered by the provider in a zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceConfig {
    pub zone: String,
    pub instance_type: String,
    pub instance_family: String,
    pub cpu: u32,

    /// Memory in GB
    pub memory: u32,

    /// Intranet bandwidth in Gbps
    pub instance_bandwidth: f64,

    /// Sale status, "SELL" when stock is available
    #[serde(default)]
    pub status: String,

    pub price: PriceInfo,
}

impl InstanceConfig {
    pub fn is_on_sale(&self) -> bool {
        self.status == "SELL"
    }

    pub fn is_hourly(&self) -> bool {
        self.price.charge_unit == "HOUR"
    }
}

/// Lifecycle state reported for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Pending,
    LaunchFailed,
    Running,
    Stopped,
    Starting,
    Stopping,
    Rebooting,
    Shutdown,
    Terminating,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    /// States in which the provider has not settled the instance yet
    pub fn is_transient(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Terminating)
    }
}

/// Instance description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceInfo {
    pub instance_id: String,
    pub instance_state: InstanceState,

    #[serde(default)]
    pub public_ip_addresses: Vec<String>,
}

impl InstanceInfo {
    pub fn public_ip(&self) -> Option<&str> {
        self.public_ip_addresses
            .first()
            .map(String::as_str)
            .filter(|ip| !ip.is_empty())
    }
}

/// Freshly created login key pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyPair {
    pub key_id: String,
    pub private_key: String,
}

/// Key pair description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyPairInfo {
    pub key_id: String,

    #[serde(default)]
    pub associated_instance_ids: Vec<String>,
}

/// Instance creation request sent to the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateInstanceRequest {
    pub zone: String,
    pub instance_type: String,
    pub key_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
}

/// Instance creation response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateInstanceResponse {
    pub instance_id: String,
}

/// Termination request for one or many instances
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TerminateInstancesRequest {
    pub instance_ids: Vec<String>,
}

/// Spot reclaim notice for an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TerminationNotice {
    pub instance_id: String,
    pub imminent: bool,
}

/// Error body returned by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}
