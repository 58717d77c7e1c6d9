//! Bootstrap config handed to the agent
//!
//! The document is written to the local temp dir, delivered once over SFTP
//! and deleted locally right after.

use std::collections::BTreeMap;

use agent_protocol::BackupRecord;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// What to do with the backup ledger on launch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestoreChoice {
    /// No choice made, the launch is rejected while backups exist
    #[default]
    Unset,
    Restore,
    Discard,
}

impl Serialize for RestoreChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RestoreChoice::Unset => serializer.serialize_bool(false),
            RestoreChoice::Restore => serializer.serialize_bool(true),
            RestoreChoice::Discard => serializer.serialize_str("discard"),
        }
    }
}

/// Options of one deployment attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentOptions {
    pub maintenance: bool,
    pub restore_backup: RestoreChoice,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapConfig {
    pub secret_key: String,
    pub ws_port: u16,
    pub ws_ping_timeout_secs: u64,
    pub env: BTreeMap<String, String>,
    pub options: DeploymentOptions,
    /// Backups the agent restores before starting the workload
    pub backups: Vec<BackupRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Static part of the bootstrap config, taken from the settings
#[derive(Debug, Clone, Default)]
pub struct BootstrapTemplate {
    pub ws_port: u16,
    pub ws_ping_timeout_secs: u64,
    pub remote_dir: String,
    pub env: BTreeMap<String, String>,
    pub extra: Map<String, Value>,
}

impl BootstrapTemplate {
    pub fn render(
        &self,
        secret_key: String,
        options: DeploymentOptions,
        backups: Vec<BackupRecord>,
    ) -> BootstrapConfig {
        let mut env = BTreeMap::new();
        env.insert("DATA_DIR".to_string(), self.remote_dir.clone());
        // configured entries win over the defaults
        env.extend(self.env.clone());

        BootstrapConfig {
            secret_key,
            ws_port: self.ws_port,
            ws_ping_timeout_secs: self.ws_ping_timeout_secs,
            env,
            options,
            backups,
            extra: self.extra.clone(),
        }
    }
}
