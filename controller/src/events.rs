//! Deployment observers
//!
//! Observers are notified at the publish points of the pipeline: every stage
//! transition, every recorded error, every agent log line and the moment the
//! workload goes live.

use std::sync::Arc;

use agent_protocol::LogSync;
use tracing::{debug, error, info, warn};

use crate::deploy::stage::{ErrorSource, StageCode};

pub trait DeploymentObserver: Send + Sync {
    fn on_stage_change(&self, _stage: StageCode) {}

    fn on_error(&self, _code: StageCode, _message: &str, _source: ErrorSource) {}

    fn on_agent_log(&self, _log: &LogSync) {}

    fn on_launch_success(&self) {}
}

/// Registry of observers, built once at startup
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn DeploymentObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the [`LogObserver`] already registered
    pub fn with_logging(forward_agent_logs: bool) -> Self {
        let mut observers = Self::new();
        observers.register(Arc::new(LogObserver { forward_agent_logs }));
        observers
    }

    pub fn register(&mut self, observer: Arc<dyn DeploymentObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn stage_changed(&self, stage: StageCode) {
        for observer in &self.observers {
            observer.on_stage_change(stage);
        }
    }

    pub fn error(&self, code: StageCode, message: &str, source: ErrorSource) {
        for observer in &self.observers {
            observer.on_error(code, message, source);
        }
    }

    pub fn agent_log(&self, log: &LogSync) {
        for observer in &self.observers {
            observer.on_agent_log(log);
        }
    }

    pub fn launch_success(&self) {
        for observer in &self.observers {
            observer.on_launch_success();
        }
    }
}

/// Emits every event through `tracing`
pub struct LogObserver {
    /// Re-emit the log lines of the agent
    pub forward_agent_logs: bool,
}

impl DeploymentObserver for LogObserver {
    fn on_stage_change(&self, stage: StageCode) {
        info!(stage = stage.code(), "{}", stage.describe());
    }

    fn on_error(&self, code: StageCode, message: &str, source: ErrorSource) {
        error!(code = code.code(), source = ?source, "Deployment failed: {}", message);
    }

    fn on_agent_log(&self, log: &LogSync) {
        if !self.forward_agent_logs {
            return;
        }
        match log.level.to_lowercase().as_str() {
            "error" => error!(source = "agent", time = ?log.time, "{}", log.msg),
            "warn" | "warning" => warn!(source = "agent", time = ?log.time, "{}", log.msg),
            "debug" | "trace" => debug!(source = "agent", time = ?log.time, "{}", log.msg),
            _ => info!(source = "agent", time = ?log.time, "{}", log.msg),
        }
    }

    fn on_launch_success(&self) {
        info!("Workload is live");
    }
}
