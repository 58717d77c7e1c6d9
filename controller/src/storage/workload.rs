//! Workload telemetry reported by the agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::ControlError;
use crate::filesys::file::File;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    #[serde(default)]
    pub players_online: Option<u32>,
    #[serde(default)]
    pub players_max: Option<u32>,
    /// Seconds before the idle workload shuts itself down
    #[serde(default)]
    pub idling_time_left: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct WorkloadStore {
    file: File,
    lock: Mutex<()>,
}

impl WorkloadStore {
    pub fn new(file: File) -> Self {
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<WorkloadInfo, ControlError> {
        let _guard = self.lock.lock().await;
        Ok(self.file.read_json_opt().await?.unwrap_or_default())
    }

    pub async fn set_players(&self, online: u32, max: u32) -> Result<(), ControlError> {
        self.update(|info| {
            info.players_online = Some(online);
            info.players_max = Some(max);
        })
        .await
    }

    pub async fn set_idling_time_left(&self, seconds: i64) -> Result<(), ControlError> {
        self.update(|info| info.idling_time_left = Some(seconds)).await
    }

    /// Whole document, or a single field when `key` is given
    pub async fn get(&self, key: Option<&str>) -> Result<Option<Value>, ControlError> {
        let info = serde_json::to_value(self.load().await?)?;
        Ok(match key {
            None => Some(info),
            Some(key) => info.get(key).filter(|v| !v.is_null()).cloned(),
        })
    }

    pub async fn clear(&self) -> Result<(), ControlError> {
        let _guard = self.lock.lock().await;
        self.file.delete().await
    }

    async fn update<F>(&self, f: F) -> Result<(), ControlError>
    where
        F: FnOnce(&mut WorkloadInfo),
    {
        let _guard = self.lock.lock().await;
        let mut info: WorkloadInfo = self.file.read_json_opt().await?.unwrap_or_default();
        f(&mut info);
        info.updated_at = Some(Utc::now());
        self.file.write_json(&info).await
    }
}
