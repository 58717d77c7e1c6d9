//! Instance detail store

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::ControlError;
use crate::filesys::file::File;

/// Cloud resources of the current deployment, filled in as they are created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceDetail {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub instance_ip: Option<String>,
    #[serde(default)]
    pub key_pair_id: Option<String>,
}

pub struct InstanceStore {
    file: File,
    lock: Mutex<()>,
}

impl InstanceStore {
    pub fn new(file: File) -> Self {
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    /// Current detail, empty when nothing was provisioned
    pub async fn load(&self) -> Result<InstanceDetail, ControlError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Apply `f` to the stored detail and persist the result
    pub async fn update<F>(&self, f: F) -> Result<InstanceDetail, ControlError>
    where
        F: FnOnce(&mut InstanceDetail),
    {
        let _guard = self.lock.lock().await;
        let mut detail = self.read().await?;
        f(&mut detail);
        self.file.write_json(&detail).await?;
        Ok(detail)
    }

    /// Whole document, or a single field when `key` is given
    pub async fn get(&self, key: Option<&str>) -> Result<Option<Value>, ControlError> {
        let detail = serde_json::to_value(self.load().await?)?;
        Ok(match key {
            None => Some(detail),
            Some(key) => detail.get(key).filter(|v| !v.is_null()).cloned(),
        })
    }

    pub async fn reset(&self) -> Result<(), ControlError> {
        let _guard = self.lock.lock().await;
        self.file.delete().await
    }

    async fn read(&self) -> Result<InstanceDetail, ControlError> {
        Ok(self.file.read_json_opt().await?.unwrap_or_default())
    }
}
