//! Server state

use std::sync::Arc;

use crate::deploy::orchestrator::Orchestrator;

/// Server state shared across handlers
pub struct ServerState {
    pub version: String,
    pub orchestrator: Arc<Orchestrator>,
}

impl ServerState {
    pub fn new(version: String, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            version,
            orchestrator,
        }
    }
}
