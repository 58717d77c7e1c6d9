//! Transport backed by the system `ssh` and `sftp` binaries

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::ControlError;
use crate::transport::{dir_prefixes, remote_parent, ExecOutput, Session, Transport, Upload};

/// SSH connection options
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            connect_timeout: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

pub struct OpenSshTransport {
    options: SshOptions,
}

impl OpenSshTransport {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn common_args(&self, session: &Session) -> Vec<String> {
        vec![
            "-i".to_string(),
            session.key_path.to_string_lossy().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!(
                "ServerAliveInterval={}",
                self.options.keep_alive_interval.as_secs().max(1)
            ),
        ]
    }

    async fn ssh(&self, session: &Session, command: &str) -> Result<ExecOutput, ControlError> {
        let output = Command::new("ssh")
            .args(self.common_args(session))
            .arg("-p")
            .arg(session.port.to_string())
            .arg(session.destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ControlError::TransportError(format!("failed to spawn ssh: {e}")))?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run an `sftp -b -` batch
    async fn sftp(&self, session: &Session, batch: &str) -> Result<(), ControlError> {
        debug!("sftp batch for {}:\n{}", session.host, batch);
        let mut child = Command::new("sftp")
            .args(self.common_args(session))
            .arg("-P")
            .arg(session.port.to_string())
            .arg("-b")
            .arg("-")
            .arg(session.destination())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlError::TransportError(format!("failed to spawn sftp: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(batch.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ControlError::TransportError(format!(
                "sftp to {} failed: {}",
                session.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Quote a path for an sftp batch line
fn quote(path: &str) -> String {
    format!("\"{}\"", path.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `-mkdir` for every prefix of `dirs`, existing ones are ignored by sftp
fn mkdir_lines(dirs: &[&str]) -> Vec<String> {
    let mut seen = Vec::new();
    for dir in dirs {
        for prefix in dir_prefixes(dir) {
            if !seen.contains(&prefix) {
                seen.push(prefix);
            }
        }
    }
    seen.into_iter()
        .map(|dir| format!("-mkdir {}", quote(&dir)))
        .collect()
}

fn upload_batch(files: &[Upload]) -> String {
    let parents: Vec<&str> = files
        .iter()
        .filter_map(|f| remote_parent(&f.remote))
        .collect();
    let mut lines = mkdir_lines(&parents);
    for file in files {
        let local = file.local.to_string_lossy().replace('\\', "/");
        lines.push(format!("put {} {}", quote(&local), quote(&file.remote)));
        lines.push(format!("chmod 755 {}", quote(&file.remote)));
    }
    lines.join("\n") + "\n"
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn connect(&self, host: &str, key_path: &Path) -> Result<Session, ControlError> {
        let session = Session {
            host: host.to_string(),
            user: self.options.user.clone(),
            port: self.options.port,
            key_path: key_path.to_path_buf(),
        };
        let check = self.ssh(&session, "true").await?;
        if !check.success() {
            return Err(ControlError::TransportError(format!(
                "ssh check against {} failed: {}",
                host,
                check.stderr.trim()
            )));
        }
        info!("Connected to {} through SSH", session.destination());
        Ok(session)
    }

    async fn upload_files(&self, session: &Session, files: &[Upload]) -> Result<(), ControlError> {
        if files.is_empty() {
            return Ok(());
        }
        self.sftp(session, &upload_batch(files)).await?;
        info!("Delivered {} files to {}", files.len(), session.host);
        Ok(())
    }

    async fn make_remote_dirs(&self, session: &Session, path: &str) -> Result<(), ControlError> {
        let batch = mkdir_lines(&[path]).join("\n") + "\n";
        self.sftp(session, &batch).await
    }

    async fn exec(&self, session: &Session, command: &str) -> Result<ExecOutput, ControlError> {
        self.ssh(session, command).await
    }
}
