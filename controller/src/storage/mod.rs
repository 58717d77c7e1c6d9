//! Persisted state of the control plane

pub mod instance;
pub mod layout;
pub mod queue;
pub mod settings;
pub mod status;
pub mod workload;
