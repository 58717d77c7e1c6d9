//! Application configuration options

use std::time::Duration;

use crate::channel::ChannelOptions;
use crate::cloud::filter::EligibilityPolicy;
use crate::deploy::bootstrap::BootstrapTemplate;
use crate::deploy::cleanup::ReclaimOptions;
use crate::deploy::orchestrator::OrchestratorOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::transport::openssh::SshOptions;
use crate::transport::RetryPolicy;
use crate::utils::PollOptions;
use crate::workers::preemption;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Operator HTTP server
    pub server: ServerOptions,

    /// Cloud provider gateway
    pub cloud: CloudOptions,

    pub ssh: SshOptions,

    pub orchestrator: OrchestratorOptions,

    /// Forward agent log lines to the local log
    pub forward_agent_logs: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            server: ServerOptions::default(),
            cloud: CloudOptions::default(),
            ssh: SshOptions::default(),
            orchestrator: OrchestratorOptions::default(),
            forward_agent_logs: true,
        }
    }
}

impl AppOptions {
    /// Build the options from the settings file
    pub fn from_settings(layout: StorageLayout, settings: &Settings) -> Self {
        let agent = &settings.agent;
        let timing = &settings.timing;

        let orchestrator = OrchestratorOptions {
            instance_poll: PollOptions {
                interval: Duration::from_secs(timing.instance_poll_interval_secs),
                timeout: Some(Duration::from_secs(timing.instance_running_timeout_secs)),
            },
            ssh_retry: RetryPolicy {
                attempts: settings.ssh.connect_attempts,
                delay: Duration::from_secs(settings.ssh.retry_delay_secs),
            },
            bootstrap_command: agent.bootstrap_command.clone(),
            secret_length: agent.secret_length,
            bootstrap: BootstrapTemplate {
                ws_port: agent.ws_port,
                ws_ping_timeout_secs: agent.ping_timeout_secs,
                remote_dir: agent.remote_dir.clone(),
                env: agent.env.clone(),
                extra: agent.extra.clone(),
            },
            channel: ChannelOptions {
                port: agent.ws_port,
                ping_timeout: Duration::from_secs(agent.ping_timeout_secs),
                connect_timeout: Duration::from_secs(agent.connect_timeout_secs),
                reconnect_delay: Duration::from_secs(agent.reconnect_delay_secs),
                max_reconnect_attempts: agent.max_reconnect_attempts,
                send_poll_interval: Duration::from_millis(agent.send_poll_interval_ms),
                send_timeout: Duration::from_secs(agent.send_timeout_secs),
            },
            reclaim: ReclaimOptions {
                orphan_poll_interval: Duration::from_secs(timing.orphan_poll_interval_secs),
                key_delete_poll_interval: Duration::from_secs(timing.key_delete_poll_interval_secs),
                settle_timeout: Duration::from_secs(timing.key_delete_timeout_secs),
            },
            preemption: preemption::Options {
                interval: Duration::from_secs(timing.preemption_poll_interval_secs),
            },
        };

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            cloud: CloudOptions {
                gateway_url: settings.cloud.gateway_url.clone(),
                gateway_token: settings.cloud.gateway_token.clone(),
                project_id: settings.cloud.project_id,
                policy: EligibilityPolicy::from(&settings.cloud.eligibility),
            },
            ssh: SshOptions {
                user: settings.ssh.user.clone(),
                port: settings.ssh.port,
                connect_timeout: Duration::from_secs(settings.ssh.connect_timeout_secs),
                keep_alive_interval: Duration::from_secs(settings.ssh.keep_alive_interval_secs),
            },
            orchestrator,
            forward_agent_logs: agent.forward_logs,
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Pick up an unfinished deployment on start
    pub resume_on_start: bool,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            resume_on_start: true,
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Cloud gateway options
#[derive(Clone, Default)]
pub struct CloudOptions {
    pub gateway_url: String,

    /// Bearer token, never logged
    pub gateway_token: Option<String>,

    pub project_id: Option<i64>,

    pub policy: EligibilityPolicy,
}

impl std::fmt::Debug for CloudOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudOptions")
            .field("gateway_url", &self.gateway_url)
            .field("gateway_token", &self.gateway_token.as_ref().map(|_| "[REDACTED]"))
            .field("project_id", &self.project_id)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Operator HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}
