//! Status ledger
//!
//! The ledger is the authoritative record of where the pipeline stands. All
//! writes go through one mutex so a transition is on disk before the caller
//! moves on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::deploy::stage::{ErrorSource, StageCode};
use crate::errors::ControlError;
use crate::filesys::file::File;

/// Persisted status document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub stage_code: StageCode,
    pub message: String,
    #[serde(default)]
    pub error_source: ErrorSource,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub last_error_time: Option<DateTime<Utc>>,
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self {
            stage_code: StageCode::IDLE,
            message: StageCode::IDLE.describe(),
            error_source: ErrorSource::None,
            last_error: String::new(),
            last_error_time: None,
        }
    }
}

/// Outcome of reviving an error stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revived {
    pub stage: StageCode,
    pub source: ErrorSource,
}

/// Single-writer store of the [`StatusRecord`]
pub struct StatusLedger {
    file: File,
    record: Mutex<StatusRecord>,
}

impl StatusLedger {
    /// Load the ledger, creating the default document when absent
    pub async fn open(file: File) -> Result<Self, ControlError> {
        let record = match file.read_json_opt::<StatusRecord>().await? {
            Some(record) => record,
            None => {
                let record = StatusRecord::default();
                file.write_json(&record).await?;
                record
            }
        };
        Ok(Self {
            file,
            record: Mutex::new(record),
        })
    }

    pub async fn stage(&self) -> StageCode {
        self.record.lock().await.stage_code
    }

    pub async fn record(&self) -> StatusRecord {
        self.record.lock().await.clone()
    }

    /// Persist a new stage code
    pub async fn set_stage(&self, stage: StageCode) -> Result<(), ControlError> {
        let mut record = self.record.lock().await;
        let mut next = record.clone();
        next.stage_code = stage;
        next.message = stage.describe();
        self.file.write_json(&next).await?;
        debug!("Stage {} -> {}", record.stage_code, stage);
        *record = next;
        Ok(())
    }

    /// Record an error against the current stage and return the error code
    pub async fn record_error(
        &self,
        message: &str,
        source: ErrorSource,
    ) -> Result<StageCode, ControlError> {
        let mut record = self.record.lock().await;
        let error_code = record.stage_code.to_error();
        let next = StatusRecord {
            stage_code: error_code,
            message: format!("Fatal: {message}"),
            error_source: source,
            last_error: message.to_string(),
            last_error_time: Some(Utc::now()),
        };
        self.file.write_json(&next).await?;
        *record = next;
        Ok(error_code)
    }

    /// Lift an error code back to the stage that failed
    ///
    /// Returns `None` when the current stage is not an error.
    pub async fn revive(&self) -> Result<Option<Revived>, ControlError> {
        let mut record = self.record.lock().await;
        let Some(stage) = record.stage_code.revived() else {
            return Ok(None);
        };
        let source = record.error_source;
        let mut next = record.clone();
        next.stage_code = stage;
        next.message = stage.describe();
        next.error_source = ErrorSource::None;
        self.file.write_json(&next).await?;
        *record = next;
        Ok(Some(Revived { stage, source }))
    }
}
