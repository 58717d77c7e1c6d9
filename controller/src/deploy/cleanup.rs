//! Reclamation of cloud resources and local temp state

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cloud::{CloudClient, CloudError};
use crate::errors::ControlError;
use crate::filesys::dir::Dir;
use crate::storage::instance::InstanceStore;
use crate::utils::{poll_until, PollError, PollOptions};

#[derive(Debug, Clone)]
pub struct ReclaimOptions {
    /// Wait between checks for instances still being created or terminated
    pub orphan_poll_interval: Duration,
    pub key_delete_poll_interval: Duration,
    /// Bound on every provider-consistency wait
    pub settle_timeout: Duration,
}

impl Default for ReclaimOptions {
    fn default() -> Self {
        Self {
            orphan_poll_interval: Duration::from_secs(5),
            key_delete_poll_interval: Duration::from_secs(5),
            settle_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Cleaned,
    /// Another cleanup was running, nothing was done
    AlreadyCleaning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDeletion {
    Deleted,
    /// Another caller is already waiting to delete this key
    AlreadyPending,
    AlreadyGone,
    /// The provider refused or never released the key
    Abandoned,
}

struct CleaningGuard<'a>(&'a AtomicBool);

impl Drop for CleaningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Reclaimer {
    cloud: Arc<dyn CloudClient>,
    instances: Arc<InstanceStore>,
    temp_dir: Dir,
    options: ReclaimOptions,
    cleaning: AtomicBool,
    pending_keys: Mutex<HashSet<String>>,
}

/// "Already gone" is success, a refusal is a warning, anything else escalates
fn tolerate(result: Result<(), CloudError>, what: &str) -> Result<(), ControlError> {
    match result {
        Ok(()) => Ok(()),
        Err(CloudError::NotFound(_)) => {
            debug!("{}: already gone", what);
            Ok(())
        }
        Err(CloudError::Provider { code, message }) => {
            warn!("{} refused by the provider: {} {}", what, code, message);
            Ok(())
        }
        Err(e) => Err(ControlError::ReclaimError(format!("{what}: {e}"))),
    }
}

impl Reclaimer {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        instances: Arc<InstanceStore>,
        temp_dir: Dir,
        options: ReclaimOptions,
    ) -> Self {
        Self {
            cloud,
            instances,
            temp_dir,
            options,
            cleaning: AtomicBool::new(false),
            pending_keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::SeqCst)
    }

    /// Tear down everything the current deployment owns
    ///
    /// Safe to call repeatedly. An overlapping call returns
    /// [`CleanupOutcome::AlreadyCleaning`] without touching the provider.
    pub async fn clean_deploy(&self) -> Result<CleanupOutcome, ControlError> {
        if self.cleaning.swap(true, Ordering::SeqCst) {
            info!("Cleanup already in progress");
            return Ok(CleanupOutcome::AlreadyCleaning);
        }
        let _guard = CleaningGuard(&self.cleaning);

        let detail = self.instances.load().await?;
        let tracked = detail.instance_id.as_deref();

        if let Some(instance_id) = tracked {
            info!("Terminating instance {}", instance_id);
            tolerate(
                self.cloud
                    .terminate_instances(&[instance_id.to_string()])
                    .await,
                "Terminating the instance",
            )?;
        }

        self.sweep_orphans(tracked).await?;

        if let Some(key_id) = detail.key_pair_id.as_deref() {
            match self.delete_key_pair(key_id).await? {
                KeyDeletion::Abandoned => warn!("Key pair {} was left behind", key_id),
                outcome => debug!("Key pair {}: {:?}", key_id, outcome),
            }
        }

        // command queue and backup ledger live outside the temp dir
        self.temp_dir.clear_files().await?;
        info!("Deployment cleaned up");
        Ok(CleanupOutcome::Cleaned)
    }

    /// Terminate every project instance other than `tracked`
    ///
    /// Waits for the provider to settle first so an instance still being
    /// created is not missed. Returns the ids that were terminated.
    pub async fn sweep_orphans(&self, tracked: Option<&str>) -> Result<Vec<String>, ControlError> {
        let cloud = &self.cloud;
        let options = PollOptions {
            interval: self.options.orphan_poll_interval,
            timeout: Some(self.options.settle_timeout),
        };
        let settled = poll_until(&options, None, || async move {
            let instances = cloud.describe_instances().await?;
            let busy = instances.iter().any(|i| i.instance_state.is_transient());
            Ok::<_, CloudError>((!busy).then_some(instances))
        })
        .await;

        let instances = match settled {
            Ok(instances) => instances,
            Err(PollError::Failed(e)) => {
                tolerate(Err(e), "Listing instances")?;
                return Ok(Vec::new());
            }
            Err(PollError::Timeout(t)) => {
                warn!("Instances did not settle within {:?}, skipping the sweep", t);
                return Ok(Vec::new());
            }
            Err(PollError::Cancelled) => return Ok(Vec::new()),
        };

        let orphans: Vec<String> = instances
            .into_iter()
            .map(|i| i.instance_id)
            .filter(|id| Some(id.as_str()) != tracked)
            .collect();
        if orphans.is_empty() {
            return Ok(orphans);
        }

        warn!("Terminating out-of-control instances: {:?}", orphans);
        tolerate(
            self.cloud.terminate_instances(&orphans).await,
            "Terminating out-of-control instances",
        )?;
        Ok(orphans)
    }

    /// Delete a key pair once no instance holds it any more
    ///
    /// Concurrent requests for the same key are deduplicated.
    pub async fn delete_key_pair(&self, key_id: &str) -> Result<KeyDeletion, ControlError> {
        if !self.pending_keys.lock().await.insert(key_id.to_string()) {
            info!("Deletion of key pair {} is already pending", key_id);
            return Ok(KeyDeletion::AlreadyPending);
        }
        let result = self.delete_key_pair_when_free(key_id).await;
        self.pending_keys.lock().await.remove(key_id);
        result
    }

    async fn delete_key_pair_when_free(&self, key_id: &str) -> Result<KeyDeletion, ControlError> {
        let cloud = &self.cloud;
        let options = PollOptions {
            interval: self.options.key_delete_poll_interval,
            timeout: Some(self.options.settle_timeout),
        };
        // Some(true) when free, Some(false) when already gone
        let free = poll_until(&options, None, || async move {
            let instances = cloud.describe_instances().await?;
            if instances.iter().any(|i| i.instance_state.is_transient()) {
                return Ok::<_, CloudError>(None);
            }
            match cloud.describe_key_pair(key_id).await {
                Ok(info) if info.associated_instance_ids.is_empty() => Ok(Some(true)),
                Ok(info) => {
                    debug!(
                        "Key pair {} still bound to {:?}",
                        key_id, info.associated_instance_ids
                    );
                    Ok(None)
                }
                Err(CloudError::NotFound(_)) => Ok(Some(false)),
                Err(e) => Err(e),
            }
        })
        .await;

        match free {
            Ok(true) => {}
            Ok(false) => return Ok(KeyDeletion::AlreadyGone),
            Err(PollError::Failed(e)) => {
                tolerate(Err(e), "Checking the key pair")?;
                return Ok(KeyDeletion::Abandoned);
            }
            Err(PollError::Timeout(t)) => {
                warn!("Key pair {} still in use after {:?}", key_id, t);
                return Ok(KeyDeletion::Abandoned);
            }
            Err(PollError::Cancelled) => return Ok(KeyDeletion::Abandoned),
        }

        match self.cloud.delete_key_pair(key_id).await {
            Ok(()) => {
                info!("Deleted key pair {}", key_id);
                Ok(KeyDeletion::Deleted)
            }
            Err(CloudError::NotFound(_)) => Ok(KeyDeletion::AlreadyGone),
            Err(e) => {
                tolerate(Err(e), "Deleting the key pair")?;
                Ok(KeyDeletion::Abandoned)
            }
        }
    }
}
