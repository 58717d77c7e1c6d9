//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::ControlError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), ControlError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// List files in the directory, sorted by name
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, ControlError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Remove every file in the directory, keeping the directory itself
    pub async fn clear_files(&self) -> Result<(), ControlError> {
        if !self.exists().await {
            return Ok(());
        }
        for path in self.list_files().await? {
            File::new(path).delete().await?;
        }
        Ok(())
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }
}
