//! SSH command execution and SFTP file delivery

pub mod openssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::warn;

use crate::errors::{ControlError, Interrupt, StageResult};
use crate::utils::wait_stopped;

/// An authenticated route to the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: PathBuf,
}

impl Session {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the command was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A local file and where it goes on the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub local: PathBuf,
    pub remote: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session, a single attempt
    async fn connect(&self, host: &str, key_path: &Path) -> Result<Session, ControlError>;

    /// Copy files, creating the remote parent directories
    async fn upload_files(&self, session: &Session, files: &[Upload]) -> Result<(), ControlError>;

    /// Create `path` and all of its parents
    async fn make_remote_dirs(&self, session: &Session, path: &str) -> Result<(), ControlError>;

    async fn exec(&self, session: &Session, command: &str) -> Result<ExecOutput, ControlError>;
}

/// Fixed backoff for [`connect_with_retry`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

/// Connect, retrying with a fixed delay until the attempts run out
///
/// A `true` on `stop` aborts silently.
pub async fn connect_with_retry(
    transport: &dyn Transport,
    host: &str,
    key_path: &Path,
    policy: &RetryPolicy,
    stop: &mut watch::Receiver<bool>,
) -> StageResult<Session> {
    let attempts = policy.attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        if *stop.borrow() {
            return Err(Interrupt::Silent);
        }
        match transport.connect(host, key_path).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                warn!("SSH attempt {}/{} to {} failed: {}", attempt, attempts, host, e);
                last_err = Some(e);
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(policy.delay) => {}
                _ = wait_stopped(stop) => return Err(Interrupt::Silent),
            }
        }
    }
    Err(Interrupt::Failed(ControlError::TransportError(format!(
        "unable to connect to {} after {} attempts: {}",
        host,
        attempts,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))))
}

/// Every prefix of an absolute POSIX path, shortest first
pub fn dir_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        prefixes.push(current.clone());
    }
    prefixes
}

/// Parent directory of a POSIX path
pub fn remote_parent(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|p| !p.is_empty())
}
