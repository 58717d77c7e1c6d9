//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::ControlError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the control plane
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Status ledger document
    pub fn status_file(&self) -> File {
        File::new(self.base_dir.join("backend_status.json"))
    }

    /// Commands waiting for the workload to go live
    pub fn command_queue_file(&self) -> File {
        File::new(self.base_dir.join("command_queue.json"))
    }

    /// Incremental backups reported by the agent
    pub fn backup_ledger_file(&self) -> File {
        File::new(self.base_dir.join("backup_records.json"))
    }

    /// Temporary files of the current deployment
    pub fn server_temp_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("server_data"))
    }

    /// Present while a deployment is active
    pub fn lock_file(&self) -> File {
        self.server_temp_dir().file("launch.lock")
    }

    /// Private key used to log into the instance
    pub fn login_key_file(&self) -> File {
        self.server_temp_dir().file("login.pem")
    }

    /// Instance id, address and key pair id
    pub fn instance_details_file(&self) -> File {
        self.server_temp_dir().file("instance_details.json")
    }

    /// Bootstrap config waiting to be delivered
    pub fn bootstrap_config_file(&self) -> File {
        self.server_temp_dir().file(BOOTSTRAP_CONFIG_NAME)
    }

    /// Telemetry reported by the agent
    pub fn workload_info_file(&self) -> File {
        self.server_temp_dir().file("workload_info.json")
    }

    /// Scripts delivered to the instance
    pub fn scripts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("scripts"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), ControlError> {
        Dir::new(&self.base_dir).create().await?;
        self.server_temp_dir().create().await?;
        self.scripts_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

/// File name of the bootstrap config, locally and on the instance
pub const BOOTSTRAP_CONFIG_NAME: &str = "ins_side_configs.tmp.json";

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/spotforge");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".spotforge");

        Self::new(base_dir)
    }
}
