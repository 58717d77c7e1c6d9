//! Utility functions

use std::future::Future;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// Version information for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Random alphanumeric secret
pub fn random_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Resolves once `stop` turns true, never if the sender is gone
pub async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Fixed-interval polling options
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` polls until the condition holds
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub enum PollError<E> {
    Timeout(Duration),
    Cancelled,
    Failed(E),
}

/// Call `check` every interval until it yields a value
///
/// A failed check ends the wait immediately. When `stop` is given, a `true`
/// on it cancels the wait.
pub async fn poll_until<T, E, F, Fut>(
    options: &PollOptions,
    mut stop: Option<&mut watch::Receiver<bool>>,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    loop {
        if let Some(stop) = stop.as_deref() {
            if *stop.borrow() {
                return Err(PollError::Cancelled);
            }
        }

        if let Some(value) = check().await.map_err(PollError::Failed)? {
            return Ok(value);
        }

        if let Some(timeout) = options.timeout {
            if started.elapsed() >= timeout {
                return Err(PollError::Timeout(timeout));
            }
        }

        match stop.as_deref_mut() {
            Some(stop) => {
                tokio::select! {
                    _ = tokio::time::sleep(options.interval) => {}
                    _ = wait_stopped(stop) => return Err(PollError::Cancelled),
                }
            }
            None => tokio::time::sleep(options.interval).await,
        }
    }
}
