//! Durable command queue and backup ledger

use agent_protocol::BackupRecord;
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::ControlError;
use crate::filesys::file::File;

/// Console commands issued while the workload was not live
pub struct CommandQueue {
    file: File,
    lock: Mutex<()>,
}

impl CommandQueue {
    pub fn new(file: File) -> Self {
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    pub async fn push(&self, command: &str) -> Result<usize, ControlError> {
        let _guard = self.lock.lock().await;
        let mut commands = self.read().await?;
        commands.push(command.to_string());
        self.file.write_json(&commands).await?;
        Ok(commands.len())
    }

    pub async fn pending(&self) -> Result<Vec<String>, ControlError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Take every queued command in FIFO order, leaving the queue empty
    pub async fn drain(&self) -> Result<Vec<String>, ControlError> {
        let _guard = self.lock.lock().await;
        let commands = self.read().await?;
        self.file.delete().await?;
        Ok(commands)
    }

    /// Put commands that could not be sent back at the head of the queue
    pub async fn requeue(&self, unsent: Vec<String>) -> Result<(), ControlError> {
        if unsent.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut commands = unsent;
        commands.extend(self.read().await?);
        self.file.write_json(&commands).await
    }

    async fn read(&self) -> Result<Vec<String>, ControlError> {
        Ok(self.file.read_json_opt().await?.unwrap_or_default())
    }
}

/// Incremental backups awaiting restore or discard
pub struct BackupLedger {
    file: File,
    lock: Mutex<()>,
}

impl BackupLedger {
    pub fn new(file: File) -> Self {
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, record: BackupRecord) -> Result<(), ControlError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        info!("Recording backup {}", record.name);
        records.push(record);
        self.file.write_json(&records).await
    }

    pub async fn records(&self) -> Result<Vec<BackupRecord>, ControlError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn is_empty(&self) -> Result<bool, ControlError> {
        Ok(self.records().await?.is_empty())
    }

    /// Drop the whole ledger
    pub async fn discard(&self) -> Result<(), ControlError> {
        let _guard = self.lock.lock().await;
        self.file.delete().await
    }

    /// Hand the records over and clear the ledger in one step
    pub async fn take(&self) -> Result<Vec<BackupRecord>, ControlError> {
        let _guard = self.lock.lock().await;
        let records = self.read().await?;
        self.file.delete().await?;
        Ok(records)
    }

    async fn read(&self) -> Result<Vec<BackupRecord>, ControlError> {
        Ok(self.file.read_json_opt().await?.unwrap_or_default())
    }
}
