//! Settings file management

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Control plane settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write a daily rolling log file
    #[serde(default)]
    pub log_to_file: bool,

    /// Operator HTTP surface
    #[serde(default)]
    pub server: ServerSettings,

    /// Cloud provider gateway
    #[serde(default)]
    pub cloud: CloudSettings,

    /// SSH transport
    #[serde(default)]
    pub ssh: SshSettings,

    /// Agent control channel
    #[serde(default)]
    pub agent: AgentSettings,

    /// Poll intervals and timeouts
    #[serde(default)]
    pub timing: TimingSettings,
}

fn default_true() -> bool {
    true
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8765
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Cloud gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Base URL of the provider gateway
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Bearer token sent to the gateway, wrapped as a secret by the client
    #[serde(default, skip_serializing)]
    pub gateway_token: Option<String>,

    /// Project the instances are created in
    #[serde(default)]
    pub project_id: Option<i64>,

    #[serde(default)]
    pub eligibility: EligibilitySettings,
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:9000/v1".to_string()
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            gateway_token: None,
            project_id: None,
            eligibility: EligibilitySettings::default(),
        }
    }
}

/// Which instance configurations may be launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilitySettings {
    /// Instance family prefixes, e.g. `S5`
    #[serde(default = "default_families")]
    pub families: Vec<String>,

    #[serde(default = "default_cpu")]
    pub cpu: u32,

    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,

    /// Minimum intranet bandwidth in Gbps
    #[serde(default)]
    pub min_bandwidth: f64,

    /// Inclusive hourly discounted price range
    #[serde(default = "default_hour_price_range")]
    pub hour_price_range: [f64; 2],
}

fn default_families() -> Vec<String> {
    vec!["S".to_string(), "SA".to_string()]
}

fn default_cpu() -> u32 {
    4
}

fn default_memory_gb() -> u32 {
    8
}

fn default_hour_price_range() -> [f64; 2] {
    [0.0, 1.0]
}

impl Default for EligibilitySettings {
    fn default() -> Self {
        Self {
            families: default_families(),
            cpu: default_cpu(),
            memory_gb: default_memory_gb(),
            min_bandwidth: 0.0,
            hour_price_range: default_hour_price_range(),
        }
    }
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_keep_alive_interval_secs() -> u64 {
    15
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            connect_attempts: default_connect_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
        }
    }
}

/// Agent control channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Port the agent listens on
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_agent_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_send_poll_interval_ms")]
    pub send_poll_interval_ms: u64,

    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Directory on the instance receiving the bootstrap files
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Command run over SSH once the files are delivered
    #[serde(default = "default_bootstrap_command")]
    pub bootstrap_command: String,

    #[serde(default = "default_secret_length")]
    pub secret_length: usize,

    /// Environment handed to the agent
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Free-form agent configuration
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    /// Forward agent logs to the observers
    #[serde(default = "default_true")]
    pub forward_logs: bool,
}

fn default_ws_port() -> u16 {
    2333
}

fn default_ping_timeout_secs() -> u64 {
    30
}

fn default_agent_connect_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_send_poll_interval_ms() -> u64 {
    500
}

fn default_send_timeout_secs() -> u64 {
    60
}

fn default_remote_dir() -> String {
    "/root/baseData".to_string()
}

fn default_bootstrap_command() -> String {
    "cd /root/baseData && bash ./scripts/bootstrap.sh".to_string()
}

fn default_secret_length() -> usize {
    128
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            ping_timeout_secs: default_ping_timeout_secs(),
            connect_timeout_secs: default_agent_connect_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            send_poll_interval_ms: default_send_poll_interval_ms(),
            send_timeout_secs: default_send_timeout_secs(),
            remote_dir: default_remote_dir(),
            bootstrap_command: default_bootstrap_command(),
            secret_length: default_secret_length(),
            env: BTreeMap::new(),
            extra: serde_json::Map::new(),
            forward_logs: true,
        }
    }
}

/// Poll intervals and timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_five")]
    pub instance_poll_interval_secs: u64,

    #[serde(default = "default_instance_running_timeout_secs")]
    pub instance_running_timeout_secs: u64,

    #[serde(default = "default_five")]
    pub preemption_poll_interval_secs: u64,

    #[serde(default = "default_five")]
    pub key_delete_poll_interval_secs: u64,

    #[serde(default = "default_key_delete_timeout_secs")]
    pub key_delete_timeout_secs: u64,

    #[serde(default = "default_five")]
    pub orphan_poll_interval_secs: u64,
}

fn default_five() -> u64 {
    5
}

fn default_instance_running_timeout_secs() -> u64 {
    300
}

fn default_key_delete_timeout_secs() -> u64 {
    600
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            instance_poll_interval_secs: default_five(),
            instance_running_timeout_secs: default_instance_running_timeout_secs(),
            preemption_poll_interval_secs: default_five(),
            key_delete_poll_interval_secs: default_five(),
            key_delete_timeout_secs: default_key_delete_timeout_secs(),
            orphan_poll_interval_secs: default_five(),
        }
    }
}
