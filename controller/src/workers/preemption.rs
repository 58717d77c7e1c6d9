//! Preemption guard worker
//!
//! Polls the provider for a spot reclaim notice on the supervised instance and
//! asks the agent for an urgent stop as soon as one shows up.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use agent_protocol::ControlRequest;
use tracing::{debug, error, info, warn};

use crate::channel::AgentChannel;
use crate::cloud::CloudClient;

/// Preemption worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A reclaim notice was seen and the agent was told
    Preempted,
    Shutdown,
}

/// Run the preemption worker
pub async fn run<S, F>(
    options: &Options,
    instance_id: &str,
    cloud: &dyn CloudClient,
    channel: &AgentChannel,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Outcome
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Preemption worker watching instance {}", instance_id);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                debug!("Preemption worker shutting down...");
                return Outcome::Shutdown;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match cloud.check_imminent_termination(instance_id).await {
            Ok(false) => {}
            Ok(true) => {
                warn!("Instance {} is about to be reclaimed", instance_id);
                tokio::select! {
                    result = channel.send(&ControlRequest::UrgentStop) => {
                        if let Err(e) = result {
                            error!("Failed to send urgent stop: {}", e);
                        }
                    }
                    _ = &mut shutdown_signal => {}
                }
                return Outcome::Preempted;
            }
            Err(e) => warn!("Preemption check failed: {}", e),
        }
    }
}
