//! Deployment orchestrator
//!
//! One deployment attempt runs as a single task walking the stage pipeline:
//! compare prices and create the instance, set up the base over SSH, supervise
//! the agent, then clean up. Every transition is persisted before the next
//! stage starts, so a restarted process picks up where the last one stopped.

use std::sync::Arc;
use std::time::Duration;

use agent_protocol::{AgentReport, ControlRequest};
use async_trait::async_trait;
use chrono::Utc;
use cloud_api::InstanceState;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{AgentChannel, ChannelOptions, InboundHandler, SupervisionEnd};
use crate::cloud::{CloudClient, CloudError};
use crate::deploy::bootstrap::{BootstrapTemplate, DeploymentOptions, RestoreChoice};
use crate::deploy::cleanup::{CleanupOutcome, ReclaimOptions, Reclaimer};
use crate::deploy::ranking::CandidateQueue;
use crate::deploy::stage::{ErrorSource, StageCode};
use crate::errors::{ControlError, Interrupt, StageResult};
use crate::events::Observers;
use crate::filesys::file::File;
use crate::storage::instance::InstanceStore;
use crate::storage::layout::{StorageLayout, BOOTSTRAP_CONFIG_NAME};
use crate::storage::queue::{BackupLedger, CommandQueue};
use crate::storage::status::{StatusLedger, StatusRecord};
use crate::storage::workload::WorkloadStore;
use crate::transport::{connect_with_retry, RetryPolicy, Session, Transport, Upload};
use crate::utils::{poll_until, random_secret, wait_stopped, PollError, PollOptions};
use crate::workers::preemption;

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Wait for the instance to run
    pub instance_poll: PollOptions,

    /// SSH connection attempts
    pub ssh_retry: RetryPolicy,

    /// Command run on the instance once the files are delivered
    pub bootstrap_command: String,

    /// Length of the per-deployment secret
    pub secret_length: usize,

    pub bootstrap: BootstrapTemplate,

    pub channel: ChannelOptions,

    pub reclaim: ReclaimOptions,

    pub preemption: preemption::Options,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            instance_poll: PollOptions {
                interval: Duration::from_secs(5),
                timeout: Some(Duration::from_secs(300)),
            },
            ssh_retry: RetryPolicy::default(),
            bootstrap_command: "cd /root/baseData && bash ./scripts/bootstrap.sh".to_string(),
            secret_length: 128,
            bootstrap: BootstrapTemplate {
                ws_port: 2333,
                ws_ping_timeout_secs: 30,
                remote_dir: "/root/baseData".to_string(),
                ..Default::default()
            },
            channel: ChannelOptions::default(),
            reclaim: ReclaimOptions::default(),
            preemption: preemption::Options::default(),
        }
    }
}

/// What happened to a console command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Sent,
    /// Stored until the workload goes live
    Queued,
}

pub struct Orchestrator {
    layout: StorageLayout,
    options: OrchestratorOptions,
    status: StatusLedger,
    instances: Arc<InstanceStore>,
    commands: CommandQueue,
    backups: BackupLedger,
    workload: WorkloadStore,
    cloud: Arc<dyn CloudClient>,
    transport: Arc<dyn Transport>,
    channel: Arc<AgentChannel>,
    reclaimer: Reclaimer,
    observers: Observers,
    stop: watch::Sender<bool>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Prepare the storage layout and load the persisted state
    pub async fn open(
        layout: StorageLayout,
        options: OrchestratorOptions,
        cloud: Arc<dyn CloudClient>,
        transport: Arc<dyn Transport>,
        observers: Observers,
    ) -> Result<Arc<Self>, ControlError> {
        layout.setup().await?;

        let status = StatusLedger::open(layout.status_file()).await?;
        let instances = Arc::new(InstanceStore::new(layout.instance_details_file()));
        let reclaimer = Reclaimer::new(
            cloud.clone(),
            instances.clone(),
            layout.server_temp_dir(),
            options.reclaim.clone(),
        );
        let channel = Arc::new(AgentChannel::new(options.channel.clone()));
        let (stop, _) = watch::channel(false);

        Ok(Arc::new(Self {
            commands: CommandQueue::new(layout.command_queue_file()),
            backups: BackupLedger::new(layout.backup_ledger_file()),
            workload: WorkloadStore::new(layout.workload_info_file()),
            layout,
            options,
            status,
            instances,
            cloud,
            transport,
            channel,
            reclaimer,
            observers,
            stop,
            running: Mutex::new(None),
        }))
    }

    // ================================ QUERIES ================================= //

    pub async fn stage(&self) -> StageCode {
        self.status.stage().await
    }

    pub async fn status(&self) -> StatusRecord {
        self.status.record().await
    }

    pub async fn instance_detail(&self, key: Option<&str>) -> Result<Option<Value>, ControlError> {
        self.instances.get(key).await
    }

    pub async fn workload_info(&self, key: Option<&str>) -> Result<Option<Value>, ControlError> {
        self.workload.get(key).await
    }

    pub async fn pending_commands(&self) -> Result<Vec<String>, ControlError> {
        self.commands.pending().await
    }

    pub async fn backup_records(&self) -> Result<Vec<agent_protocol::BackupRecord>, ControlError> {
        self.backups.records().await
    }

    pub fn channel(&self) -> &Arc<AgentChannel> {
        &self.channel
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Whether a pipeline task is alive
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    // =============================== OPERATIONS =============================== //

    /// Start a new deployment
    pub async fn launch(self: &Arc<Self>, options: DeploymentOptions) -> Result<(), ControlError> {
        if self.status.stage().await.is_error() {
            return Err(ControlError::ErrorPending);
        }
        let lock = self.layout.lock_file();
        if lock.exists().await {
            return Err(ControlError::AlreadyLaunched);
        }
        match options.restore_backup {
            RestoreChoice::Unset if !self.backups.is_empty().await? => {
                return Err(ControlError::BackupPending);
            }
            RestoreChoice::Discard => {
                info!("Discarding incremental backups");
                self.backups.discard().await?;
            }
            _ => {}
        }

        lock.write_string(&format!("Launched at {}", Utc::now().to_rfc3339()))
            .await?;
        info!("Starting a deployment: {:?}", options);
        self.spawn_entry(Some(options)).await
    }

    /// Pick up an attempt left unfinished by a previous process
    ///
    /// Returns whether a pipeline was started.
    pub async fn resume(self: &Arc<Self>) -> Result<bool, ControlError> {
        let stage = self.status.stage().await;
        if !stage.is_active() {
            return Ok(false);
        }
        info!("Resuming the deployment from stage {}", stage);
        self.spawn_entry(None).await?;
        Ok(true)
    }

    /// Lift the error stage and carry on
    pub async fn revive(self: &Arc<Self>) -> Result<StageCode, ControlError> {
        let Some(revived) = self.status.revive().await? else {
            return Err(ControlError::NothingToRevive);
        };
        info!("Revived stage {} ({:?} error)", revived.stage, revived.source);
        self.observers.stage_changed(revived.stage);

        match revived.source {
            ErrorSource::Agent => {
                // flagged first so the handshake of a fresh pipeline sends it
                if let Err(e) = self.channel.request_revive().await {
                    warn!("Revive stays pending until the agent reconnects: {}", e);
                }
                if !self.is_running().await {
                    self.spawn_entry(None).await?;
                }
            }
            ErrorSource::ControlPlane | ErrorSource::None => {
                self.spawn_entry(None).await?;
            }
        }
        Ok(revived.stage)
    }

    /// Stop supervision and release every cloud resource
    pub async fn reclaim(&self) -> Result<CleanupOutcome, ControlError> {
        info!("Reclaiming the deployment");
        self.stop.send_replace(true);
        self.join().await;

        let outcome = self.reclaimer.clean_deploy().await?;
        if outcome == CleanupOutcome::Cleaned {
            self.channel.reset().await;
            self.set_stage(StageCode::IDLE).await?;
        }
        Ok(outcome)
    }

    /// Send a console command, or queue it until the workload is live
    pub async fn send_command(&self, command: &str) -> Result<CommandOutcome, ControlError> {
        if self.status.stage().await.is_live() {
            let request = ControlRequest::Command {
                command: command.to_string(),
            };
            match self.channel.send(&request).await {
                Ok(()) => return Ok(CommandOutcome::Sent),
                Err(e) => warn!("Queueing command, the agent is unreachable: {}", e),
            }
        }
        let queued = self.commands.push(command).await?;
        debug!("{} commands queued", queued);
        Ok(CommandOutcome::Queued)
    }

    /// Ask the agent to stop the workload
    pub async fn stop(&self, force: bool) -> Result<(), ControlError> {
        let stage = self.status.stage().await;
        if stage < StageCode::AGENT_HANDSHAKE || stage >= StageCode::CLEANUP {
            return Err(ControlError::NotRunning);
        }
        let request = if force {
            ControlRequest::Kill
        } else {
            ControlRequest::Stop
        };
        self.channel.send(&request).await
    }

    /// Stop the pipeline without cleaning up, the stage stays for resume
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        self.join().await;
    }

    /// Wait for the current pipeline task
    pub async fn join(&self) {
        let handle = self.running.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Deployment task failed: {}", e);
            }
        }
    }

    // =============================== PIPELINE ================================= //

    async fn spawn_entry(
        self: &Arc<Self>,
        options: Option<DeploymentOptions>,
    ) -> Result<(), ControlError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(ControlError::AlreadyLaunched);
        }
        self.stop.send_replace(false);
        let this = self.clone();
        *running = Some(tokio::spawn(async move { this.entry(options).await }));
        Ok(())
    }

    async fn entry(&self, options: Option<DeploymentOptions>) {
        match self.run_pipeline(options).await {
            Ok(()) => info!("Deployment finished"),
            Err(Interrupt::Silent) => debug!("Deployment pipeline stopped"),
            Err(Interrupt::Failed(e)) => {
                self.handle_error(&e.to_string(), ErrorSource::ControlPlane)
                    .await
            }
        }
    }

    async fn run_pipeline(&self, options: Option<DeploymentOptions>) -> StageResult<()> {
        if self.status.stage().await >= StageCode::CLEANUP {
            // interrupted while tearing down
            return self.finish().await;
        }
        let instance_id = self.compare_and_run().await?;
        self.set_up_base(&instance_id, options).await?;
        self.monitor(&instance_id).await?;
        self.finish().await
    }

    async fn compare_and_run(&self) -> StageResult<String> {
        let stage = self.status.stage().await;
        if stage.is_active() {
            if stage >= StageCode::AWAITING_RUNNING {
                let detail = self.instances.load().await?;
                return match detail.instance_id {
                    Some(instance_id) => {
                        info!("Reusing instance {}", instance_id);
                        Ok(instance_id)
                    }
                    None => Err(ControlError::ProvisionError(
                        "no instance recorded for the unfinished deployment".to_string(),
                    )
                    .into()),
                };
            }
            info!("Rolling back the provisioning left at stage {}", stage);
            self.reclaimer.clean_deploy().await?;
            self.set_stage(StageCode::IDLE).await?;
            return Err(Interrupt::Silent);
        }

        self.advance(StageCode::COMPARING).await?;
        let configs = self.cloud.list_eligible_instance_configs().await?;
        let mut candidates = CandidateQueue::new(configs);
        if candidates.is_empty() {
            return Err(ControlError::CapacityError(
                "no instance configuration meets the requirements".to_string(),
            )
            .into());
        }
        info!("{} candidate instance configurations", candidates.len());

        self.advance(StageCode::KEY_GENERATED).await?;
        let key_pair = self.cloud.create_key_pair().await?;
        let key_file = self.layout.login_key_file();
        key_file.write_private(&key_pair.private_key).await?;
        self.instances
            .update(|d| d.key_pair_id = Some(key_pair.key_id.clone()))
            .await?;

        self.advance(StageCode::INSTANCE_CREATED).await?;
        let mut last_err: Option<CloudError> = None;
        while let Some(config) = candidates.next_best() {
            match self.cloud.create_instance(&config, &key_pair.key_id).await {
                Ok(instance_id) => {
                    info!(
                        "Created instance {} ({} in {})",
                        instance_id, config.instance_type, config.zone
                    );
                    self.instances
                        .update(|d| d.instance_id = Some(instance_id.clone()))
                        .await?;
                    return Ok(instance_id);
                }
                Err(e) => {
                    warn!(
                        "Failed to create {} in {}: {}",
                        config.instance_type, config.zone, e
                    );
                    last_err = Some(e);
                }
            }
            self.check_stop()?;
        }

        Err(ControlError::ProvisionError(format!(
            "every candidate failed, last error: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
        .into())
    }

    async fn set_up_base(
        &self,
        instance_id: &str,
        options: Option<DeploymentOptions>,
    ) -> StageResult<()> {
        if self.status.stage().await >= StageCode::AGENT_HANDSHAKE {
            // the agent is installed, it only needs the new secret
            let ip = match self.instances.load().await?.instance_ip {
                Some(ip) => ip,
                None => self.wait_until_running(instance_id).await?,
            };
            let session = self.connect(&ip).await?;
            let config = self.write_bootstrap_config(DeploymentOptions::default()).await?;
            self.transport
                .upload_files(&session, &[self.config_upload(&config)])
                .await?;
            config.delete().await?;
            return Ok(());
        }

        self.advance(StageCode::AWAITING_RUNNING).await?;
        let ip = self.wait_until_running(instance_id).await?;

        self.advance(StageCode::SSH_CONNECTED).await?;
        let session = self.connect(&ip).await?;

        self.advance(StageCode::FILES_DELIVERED).await?;
        self.deliver_files(&session, options.unwrap_or_default())
            .await?;

        self.advance(StageCode::BOOTSTRAP_EXECUTED).await?;
        let output = self
            .transport
            .exec(&session, &self.options.bootstrap_command)
            .await?;
        if !output.success() {
            return Err(ControlError::BootstrapError(format!(
                "bootstrap exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            ))
            .into());
        }
        info!("Bootstrap finished on {}", ip);
        Ok(())
    }

    async fn wait_until_running(&self, instance_id: &str) -> StageResult<String> {
        let cloud = &self.cloud;
        let mut stop = self.stop.subscribe();
        let result = poll_until(&self.options.instance_poll, Some(&mut stop), || async move {
            let info = cloud.describe_instance(instance_id).await?;
            if info.instance_state != InstanceState::Running {
                debug!("Instance {} is {:?}", instance_id, info.instance_state);
                return Ok::<_, CloudError>(None);
            }
            Ok(info.public_ip().map(str::to_string))
        })
        .await;

        let ip = match result {
            Ok(ip) => ip,
            Err(PollError::Cancelled) => return Err(Interrupt::Silent),
            Err(PollError::Timeout(t)) => {
                return Err(ControlError::Timeout(format!(
                    "instance {} not running after {:?}",
                    instance_id, t
                ))
                .into())
            }
            Err(PollError::Failed(e)) => return Err(e.into()),
        };

        info!("Instance {} is running at {}", instance_id, ip);
        self.instances
            .update(|d| d.instance_ip = Some(ip.clone()))
            .await?;
        Ok(ip)
    }

    async fn connect(&self, ip: &str) -> StageResult<Session> {
        let mut stop = self.stop.subscribe();
        connect_with_retry(
            self.transport.as_ref(),
            ip,
            self.layout.login_key_file().path(),
            &self.options.ssh_retry,
            &mut stop,
        )
        .await
    }

    fn remote_dir(&self) -> &str {
        self.options.bootstrap.remote_dir.trim_end_matches('/')
    }

    fn config_upload(&self, config: &File) -> Upload {
        Upload {
            local: config.path().to_path_buf(),
            remote: format!("{}/{}", self.remote_dir(), BOOTSTRAP_CONFIG_NAME),
        }
    }

    /// Render a bootstrap config with a fresh secret
    async fn write_bootstrap_config(
        &self,
        options: DeploymentOptions,
    ) -> Result<File, ControlError> {
        let backups = match options.restore_backup {
            RestoreChoice::Restore => self.backups.take().await?,
            RestoreChoice::Discard => {
                self.backups.discard().await?;
                Vec::new()
            }
            RestoreChoice::Unset => Vec::new(),
        };

        let secret = random_secret(self.options.secret_length);
        let config = self
            .options
            .bootstrap
            .render(secret.clone(), options, backups);
        let file = self.layout.bootstrap_config_file();
        file.write_json(&config).await?;
        self.channel.set_secret(SecretString::from(secret)).await;
        Ok(file)
    }

    async fn deliver_files(
        &self,
        session: &Session,
        options: DeploymentOptions,
    ) -> StageResult<()> {
        self.transport
            .make_remote_dirs(session, self.remote_dir())
            .await?;

        let config = self.write_bootstrap_config(options).await?;
        let mut uploads = vec![self.config_upload(&config)];

        let scripts = self.layout.scripts_dir();
        if scripts.exists().await {
            for path in scripts.list_files().await? {
                let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };
                uploads.push(Upload {
                    remote: format!("{}/scripts/{}", self.remote_dir(), name),
                    local: path,
                });
            }
        }

        self.transport.upload_files(session, &uploads).await?;
        config.delete().await?;
        Ok(())
    }

    async fn monitor(&self, instance_id: &str) -> StageResult<()> {
        if self.status.stage().await < StageCode::AGENT_HANDSHAKE {
            self.advance(StageCode::AGENT_HANDSHAKE).await?;
        }
        let ip = self.instances.load().await?.instance_ip.ok_or_else(|| {
            ControlError::ChannelError("no address recorded for the instance".to_string())
        })?;

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let mut guard_stop = self.stop.subscribe();
        let guard = {
            let options = self.options.preemption.clone();
            let instance_id = instance_id.to_string();
            let cloud = self.cloud.clone();
            let channel = self.channel.clone();
            tokio::spawn(async move {
                preemption::run(
                    &options,
                    &instance_id,
                    cloud.as_ref(),
                    channel.as_ref(),
                    tokio::time::sleep,
                    Box::pin(async move {
                        tokio::select! {
                            _ = done_rx => {}
                            _ = wait_stopped(&mut guard_stop) => {}
                        }
                    }),
                )
                .await
            })
        };

        let mut stop = self.stop.subscribe();
        let end = self.channel.supervise(&ip, self, &mut stop).await;

        let _ = done_tx.send(());
        if let Err(e) = guard.await {
            warn!("Preemption worker failed: {}", e);
        }

        match end {
            SupervisionEnd::Cancelled => Err(Interrupt::Silent),
            SupervisionEnd::Closed | SupervisionEnd::AgentGone => Ok(()),
        }
    }

    async fn finish(&self) -> StageResult<()> {
        if self.status.stage().await.is_error() {
            warn!("Supervision ended in an error stage, waiting for revive or reclaim");
            return Err(Interrupt::Silent);
        }
        self.advance(StageCode::CLEANUP).await?;
        if self.reclaimer.clean_deploy().await? == CleanupOutcome::AlreadyCleaning {
            return Err(Interrupt::Silent);
        }
        self.channel.reset().await;
        self.set_stage(StageCode::IDLE).await?;
        Ok(())
    }

    // ================================ HELPERS ================================= //

    fn check_stop(&self) -> StageResult<()> {
        if *self.stop.borrow() {
            return Err(Interrupt::Silent);
        }
        Ok(())
    }

    async fn advance(&self, stage: StageCode) -> StageResult<()> {
        self.check_stop()?;
        self.set_stage(stage).await?;
        Ok(())
    }

    async fn set_stage(&self, stage: StageCode) -> Result<(), ControlError> {
        self.status.set_stage(stage).await?;
        self.observers.stage_changed(stage);
        Ok(())
    }

    async fn handle_error(&self, message: &str, source: ErrorSource) {
        match self.status.record_error(message, source).await {
            Ok(code) => self.observers.error(code, message, source),
            Err(e) => error!("Failed to record error '{}': {}", message, e),
        }
    }

    async fn flush_commands(&self) -> Result<(), ControlError> {
        let commands = self.commands.drain().await?;
        if commands.is_empty() {
            return Ok(());
        }
        info!("Flushing {} queued commands", commands.len());

        let mut pending = commands.into_iter();
        while let Some(command) = pending.next() {
            let request = ControlRequest::Command {
                command: command.clone(),
            };
            if let Err(e) = self.channel.send(&request).await {
                let mut unsent = vec![command];
                unsent.extend(pending);
                warn!("Re-queueing {} commands: {}", unsent.len(), e);
                self.commands.requeue(unsent).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn on_report(&self, report: AgentReport) -> Result<(), ControlError> {
        match report {
            AgentReport::StatusSync { status_code } => {
                let stage = StageCode(status_code);
                if !stage.is_agent_owned() {
                    warn!("Ignoring out-of-range status {} from the agent", status_code);
                    return Ok(());
                }
                if self.status.stage().await.is_error() {
                    warn!("Ignoring status {} while in an error stage", status_code);
                    return Ok(());
                }
                self.set_stage(stage).await?;
                if stage.is_live() {
                    self.flush_commands().await?;
                }
            }
            AgentReport::LaunchSuccess => {
                self.observers.launch_success();
                self.flush_commands().await?;
            }
            AgentReport::LogSync(log) => {
                self.observers.agent_log(&log);
                if log.error {
                    self.handle_error(&log.msg, ErrorSource::Agent).await;
                }
            }
            AgentReport::PlayersNum(players) => {
                self.workload
                    .set_players(players.online, players.max)
                    .await?;
            }
            AgentReport::IdlingTimeLeft { time } => {
                self.workload.set_idling_time_left(time).await?;
            }
            AgentReport::BackupSync(Some(record)) => self.backups.append(record).await?,
            AgentReport::BackupSync(None) | AgentReport::RevokeBackup => {
                info!("Discarding incremental backups on agent request");
                self.backups.discard().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InboundHandler for Orchestrator {
    async fn handle(&self, report: AgentReport) {
        if let Err(e) = self.on_report(report).await {
            error!("Failed to handle agent report: {}", e);
        }
    }
}
