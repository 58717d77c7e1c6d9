//! Protocol models

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol violation detected while decoding a frame
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Missing payload for action: {0}")]
    MissingData(&'static str),

    #[error("Invalid payload for action {action}: {reason}")]
    InvalidData { action: &'static str, reason: String },
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub key: String,
    pub action: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Requests sent by the control plane to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Handshake: ask the agent to report its status
    StatusSync,
    /// Console command for the workload
    Command { command: String },
    /// Graceful stop
    Stop,
    /// Forced stop
    Kill,
    /// Clear an agent-side error and carry on
    Revive,
    /// The instance is about to be reclaimed by the provider
    UrgentStop,
}

impl ControlRequest {
    pub fn action(&self) -> &'static str {
        match self {
            ControlRequest::StatusSync => "status_sync",
            ControlRequest::Command { .. } => "command",
            ControlRequest::Stop => "stop",
            ControlRequest::Kill => "kill",
            ControlRequest::Revive => "revive",
            ControlRequest::UrgentStop => "urgent_stop",
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            ControlRequest::Command { command } => {
                Some(serde_json::json!({ "command": command }))
            }
            _ => None,
        }
    }

    /// Wrap the request, authenticated with `key`
    pub fn to_envelope(&self, key: &str) -> Envelope {
        Envelope {
            key: key.to_string(),
            action: self.action().to_string(),
            data: self.data(),
        }
    }
}

/// `log_sync` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSync {
    #[serde(default = "default_level")]
    pub level: String,
    pub msg: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub error: bool,
}

fn default_level() -> String {
    "info".to_string()
}

/// `players_num` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayersNum {
    pub online: u32,
    pub max: u32,
}

/// Incremental backup reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub name: String,
    pub time: i64,
}

/// Reports sent by the agent to the control plane
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReport {
    StatusSync { status_code: u32 },
    LogSync(LogSync),
    PlayersNum(PlayersNum),
    IdlingTimeLeft { time: i64 },
    /// `None` means the agent no longer needs the ledger
    BackupSync(Option<BackupRecord>),
    RevokeBackup,
    LaunchSuccess,
}

#[derive(Deserialize)]
struct StatusSyncData {
    status_code: u32,
}

#[derive(Deserialize)]
struct IdlingTimeLeftData {
    time: i64,
}

impl AgentReport {
    /// Decode the payload of an envelope according to its action
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let data = envelope.data.as_ref().filter(|v| !v.is_null());
        match envelope.action.as_str() {
            "status_sync" => {
                let parsed: StatusSyncData = required(data, "status_sync")?;
                Ok(AgentReport::StatusSync {
                    status_code: parsed.status_code,
                })
            }
            "log_sync" => Ok(AgentReport::LogSync(required(data, "log_sync")?)),
            "players_num" => Ok(AgentReport::PlayersNum(required(data, "players_num")?)),
            "idling_time_left" => {
                let parsed: IdlingTimeLeftData = required(data, "idling_time_left")?;
                Ok(AgentReport::IdlingTimeLeft { time: parsed.time })
            }
            "backup_sync" => match data {
                Some(_) => Ok(AgentReport::BackupSync(Some(required(data, "backup_sync")?))),
                None => Ok(AgentReport::BackupSync(None)),
            },
            "revoke_backup" => Ok(AgentReport::RevokeBackup),
            "launch_success" => Ok(AgentReport::LaunchSuccess),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}

fn required<T: DeserializeOwned>(
    data: Option<&Value>,
    action: &'static str,
) -> Result<T, ProtocolError> {
    let value = data.ok_or(ProtocolError::MissingData(action))?;
    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidData {
        action,
        reason: e.to_string(),
    })
}
