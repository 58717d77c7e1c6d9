//! Deployment module

pub mod bootstrap;
pub mod cleanup;
pub mod orchestrator;
pub mod ranking;
pub mod stage;
