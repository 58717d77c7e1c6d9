//! Stage codes of the deployment pipeline
//!
//! A stage code is both the current pipeline position and the persisted
//! resume marker. Codes in `[2000, 3000)` are normal progress; a failed stage
//! `S` is recorded as `S - 1000`, keeping the low digits that identify which
//! stage failed.

use std::fmt;

use serde::{Deserialize, Serialize};

const ERROR_OFFSET: u32 = 1000;

/// Stage code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageCode(pub u32);

impl StageCode {
    /// Nothing deployed
    pub const IDLE: StageCode = StageCode(2000);
    /// Comparing instance prices
    pub const COMPARING: StageCode = StageCode(2001);
    /// Login key pair generated
    pub const KEY_GENERATED: StageCode = StageCode(2002);
    /// Instance creation requested
    pub const INSTANCE_CREATED: StageCode = StageCode(2003);
    /// Waiting for the instance to run
    pub const AWAITING_RUNNING: StageCode = StageCode(2100);
    /// Connecting through SSH
    pub const SSH_CONNECTED: StageCode = StageCode(2101);
    /// Delivering bootstrap files
    pub const FILES_DELIVERED: StageCode = StageCode(2102);
    /// Running the bootstrap script
    pub const BOOTSTRAP_EXECUTED: StageCode = StageCode(2103);
    /// Connected to the agent, waiting for its reports
    pub const AGENT_HANDSHAKE: StageCode = StageCode(2200);
    /// Lower bound of the live-workload sub-range
    pub const LIVE_LOW: StageCode = StageCode(2300);
    /// Upper bound (exclusive) of the live-workload sub-range
    pub const LIVE_HIGH: StageCode = StageCode(2400);
    /// Reclaiming cloud resources
    pub const CLEANUP: StageCode = StageCode(2500);

    pub fn code(&self) -> u32 {
        self.0
    }

    /// Error codes sit one thousand below their stage
    pub fn is_error(&self) -> bool {
        (ERROR_OFFSET..Self::IDLE.0).contains(&self.0)
    }

    /// Normal progress past `IDLE`
    pub fn is_active(&self) -> bool {
        self.0 > Self::IDLE.0
    }

    /// Whether the workload accepts console commands
    pub fn is_live(&self) -> bool {
        (Self::LIVE_LOW..Self::LIVE_HIGH).contains(self)
    }

    /// Stages at which the agent owns the code
    pub fn is_agent_owned(&self) -> bool {
        self.0 > Self::AGENT_HANDSHAKE.0 && self.0 < Self::CLEANUP.0
    }

    /// Error code recorded when this stage fails
    pub fn to_error(self) -> StageCode {
        if self.is_error() {
            self
        } else {
            StageCode(self.0.saturating_sub(ERROR_OFFSET))
        }
    }

    /// Stage restored by reviving this error code
    pub fn revived(self) -> Option<StageCode> {
        self.is_error().then(|| StageCode(self.0 + ERROR_OFFSET))
    }

    /// Human readable description used as the ledger message
    pub fn describe(&self) -> String {
        if self.is_error() {
            if let Some(stage) = self.revived() {
                return format!("Failed while: {}", stage.describe());
            }
        }
        match *self {
            Self::IDLE => "Everything's fine".to_string(),
            Self::COMPARING => "Comparing instance prices".to_string(),
            Self::KEY_GENERATED => "Generating login key pair".to_string(),
            Self::INSTANCE_CREATED => "Creating instance".to_string(),
            Self::AWAITING_RUNNING => "Waiting for the instance to run".to_string(),
            Self::SSH_CONNECTED => "Connecting to the instance through SSH".to_string(),
            Self::FILES_DELIVERED => "Delivering files to the instance".to_string(),
            Self::BOOTSTRAP_EXECUTED => "Running the bootstrap script".to_string(),
            Self::AGENT_HANDSHAKE => "Connecting to the instance side".to_string(),
            Self::CLEANUP => "Cleaning up the deployment".to_string(),
            code if code.is_live() => format!("Server running ({})", code.0),
            code => format!("Instance side reported status {}", code.0),
        }
    }
}

impl fmt::Display for StageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StageCode {
    fn from(code: u32) -> Self {
        StageCode(code)
    }
}

/// Who raised the last recorded error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSource {
    #[default]
    None,
    ControlPlane,
    Agent,
}
