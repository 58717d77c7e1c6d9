//! Orchestrator pipeline tests

mod mocks;

use std::time::Duration;

use agent_protocol::{AgentReport, BackupRecord, LogSync};
use serde_json::{json, Value};

use spotforge::channel::InboundHandler;
use spotforge::deploy::bootstrap::{DeploymentOptions, RestoreChoice};
use spotforge::deploy::cleanup::CleanupOutcome;
use spotforge::deploy::orchestrator::CommandOutcome;
use spotforge::deploy::stage::{ErrorSource, StageCode};
use spotforge::errors::ControlError;
use spotforge::storage::instance::InstanceDetail;
use spotforge::storage::status::StatusRecord;

use mocks::*;

async fn persist_stage(harness: &Harness, stage: StageCode) {
    let record = StatusRecord {
        stage_code: stage,
        message: stage.describe(),
        ..Default::default()
    };
    harness.layout.status_file().write_json(&record).await.unwrap();
}

async fn persist_instance(harness: &Harness, detail: InstanceDetail) {
    harness
        .layout
        .instance_details_file()
        .write_json(&detail)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_launch_skips_failed_candidates_and_finishes() {
    let cloud = MockCloud::with_state(|s| {
        s.configs = vec![
            config("a", 10.0, 100.0),
            config("b", 8.0, 50.0),
            config("c", 20.0, 0.0),
        ];
        s.failing_types.insert("b".to_string());
    });
    let harness = Harness::new(cloud.clone()).await;
    let (listener, port) = agent_listener().await;
    let orchestrator = harness.open(fast_options(port)).await;

    orchestrator.launch(DeploymentOptions::default()).await.unwrap();

    let mut ws = accept_agent(&listener).await;
    let handshake = next_frame(&mut ws).await;
    assert_eq!(handshake["action"], "status_sync");
    let key = handshake["key"].as_str().unwrap().to_string();
    assert_eq!(key.len(), 32);

    send_report(&mut ws, &key, "status_sync", json!({ "status_code": 2300 })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.stage().await, StageCode::LIVE_LOW);
    close_normally(&mut ws).await;

    orchestrator.join().await;

    // b is cheapest but refused, a is next best
    assert_eq!(cloud.create_calls(), vec!["b".to_string(), "a".to_string()]);
    assert_eq!(orchestrator.stage().await, StageCode::IDLE);
    assert_eq!(cloud.terminated(), vec!["ins-1".to_string()]);
    assert_eq!(cloud.deleted_keys(), vec!["key-1".to_string()]);
    assert!(!harness.layout.lock_file().exists().await);
    assert!(!harness.layout.bootstrap_config_file().exists().await);

    // the delivered config carried the secret used on the channel
    let uploads = harness.transport.uploads();
    let (remote, content) = &uploads[0];
    assert_eq!(remote, "/root/baseData/ins_side_configs.tmp.json");
    let config: Value = serde_json::from_str(content).unwrap();
    assert_eq!(config["secret_key"], key.as_str());
    assert_eq!(harness.transport.execs().len(), 1);
}

#[tokio::test]
async fn test_resume_before_instance_rolls_back() {
    let cloud = MockCloud::with_state(|s| {
        s.key_pairs.insert("key-1".to_string(), Vec::new());
        s.instances.push(running("ins-orphan"));
    });
    let harness = Harness::new(cloud.clone()).await;
    persist_stage(&harness, StageCode::KEY_GENERATED).await;
    persist_instance(
        &harness,
        InstanceDetail {
            key_pair_id: Some("key-1".to_string()),
            ..Default::default()
        },
    )
    .await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;

    assert!(orchestrator.resume().await.unwrap());
    orchestrator.join().await;

    let status = orchestrator.status().await;
    assert_eq!(status.stage_code, StageCode::IDLE);
    assert!(status.last_error.is_empty());
    assert_eq!(cloud.deleted_keys(), vec!["key-1".to_string()]);
    assert_eq!(cloud.terminated(), vec!["ins-orphan".to_string()]);
    assert!(cloud.create_calls().is_empty());
}

#[tokio::test]
async fn test_resume_after_instance_reuses_it() {
    let cloud = MockCloud::with_state(|s| s.instances.push(running("ins-7")));
    let harness = Harness::new(cloud.clone()).await;
    persist_stage(&harness, StageCode(2150)).await;
    persist_instance(
        &harness,
        InstanceDetail {
            instance_id: Some("ins-7".to_string()),
            ..Default::default()
        },
    )
    .await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;

    assert!(orchestrator.resume().await.unwrap());
    orchestrator.join().await;

    assert!(cloud.create_calls().is_empty());
    assert_eq!(harness.transport.connects(), vec![AGENT_HOST.to_string()]);
    assert_eq!(harness.transport.execs().len(), 1);
    // agent never answered, the deployment was torn down
    assert_eq!(cloud.terminated(), vec!["ins-7".to_string()]);
    assert_eq!(orchestrator.stage().await, StageCode::IDLE);
}

#[tokio::test]
async fn test_resume_is_noop_when_idle() {
    let harness = Harness::new(MockCloud::with_state(|_| {})).await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;
    assert!(!orchestrator.resume().await.unwrap());
    assert!(!orchestrator.is_running().await);
}

#[tokio::test]
async fn test_launch_rejections() {
    let harness = Harness::new(MockCloud::with_state(|_| {})).await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;

    harness.layout.lock_file().write_string("Launched").await.unwrap();
    assert!(matches!(
        orchestrator.launch(DeploymentOptions::default()).await,
        Err(ControlError::AlreadyLaunched)
    ));
    harness.layout.lock_file().delete().await.unwrap();

    harness
        .layout
        .backup_ledger_file()
        .write_json(&vec![BackupRecord {
            name: "inc-1".to_string(),
            time: 1,
        }])
        .await
        .unwrap();
    let err = orchestrator
        .launch(DeploymentOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::BackupPending));
    assert!(err.to_string().contains("restorelaunch"));

    assert!(matches!(
        orchestrator.stop(false).await,
        Err(ControlError::NotRunning)
    ));
    assert!(matches!(
        orchestrator.revive().await,
        Err(ControlError::NothingToRevive)
    ));
}

#[tokio::test]
async fn test_capacity_error_blocks_launch_until_revived() {
    let cloud = MockCloud::with_state(|_| {});
    let harness = Harness::new(cloud.clone()).await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;
    harness
        .layout
        .backup_ledger_file()
        .write_json(&vec![BackupRecord {
            name: "inc-1".to_string(),
            time: 1,
        }])
        .await
        .unwrap();

    let options = DeploymentOptions {
        restore_backup: RestoreChoice::Discard,
        ..Default::default()
    };
    orchestrator.launch(options).await.unwrap();
    orchestrator.join().await;

    assert!(orchestrator.backup_records().await.unwrap().is_empty());
    let status = orchestrator.status().await;
    assert_eq!(status.stage_code, StageCode(1001));
    assert_eq!(status.error_source, ErrorSource::ControlPlane);
    assert!(status.last_error.contains("No available instance"));
    assert!(matches!(
        orchestrator.launch(DeploymentOptions::default()).await,
        Err(ControlError::ErrorPending)
    ));

    // reviving a control-plane error resumes, which rolls the attempt back
    assert_eq!(orchestrator.revive().await.unwrap(), StageCode::COMPARING);
    orchestrator.join().await;
    assert_eq!(orchestrator.stage().await, StageCode::IDLE);
    assert!(!harness.layout.lock_file().exists().await);
}

#[tokio::test]
async fn test_bootstrap_failure_is_recorded() {
    let cloud = MockCloud::with_state(|s| s.configs = vec![config("a", 1.0, 10.0)]);
    let harness = Harness::new(cloud.clone()).await;
    harness.transport.state.lock().unwrap().exec_exit_code = 127;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;

    orchestrator.launch(DeploymentOptions::default()).await.unwrap();
    orchestrator.join().await;

    let status = orchestrator.status().await;
    assert_eq!(status.stage_code, StageCode(1103));
    assert!(status.last_error.contains("bootstrap.sh: not found"));
    // resources stay up for revive or reclaim
    assert!(cloud.terminated().is_empty());

    orchestrator.reclaim().await.unwrap();
    assert_eq!(orchestrator.stage().await, StageCode::IDLE);
    assert_eq!(cloud.terminated(), vec!["ins-1".to_string()]);
}

#[tokio::test]
async fn test_agent_reports_update_stores() {
    let harness = Harness::new(MockCloud::with_state(|_| {})).await;
    persist_stage(&harness, StageCode::AGENT_HANDSHAKE).await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;

    orchestrator
        .handle(AgentReport::IdlingTimeLeft { time: 300 })
        .await;
    assert_eq!(
        orchestrator
            .workload_info(Some("idling_time_left"))
            .await
            .unwrap(),
        Some(json!(300))
    );

    orchestrator
        .handle(AgentReport::BackupSync(Some(BackupRecord {
            name: "inc-1".to_string(),
            time: 17,
        })))
        .await;
    assert_eq!(orchestrator.backup_records().await.unwrap().len(), 1);
    orchestrator.handle(AgentReport::BackupSync(None)).await;
    assert!(orchestrator.backup_records().await.unwrap().is_empty());

    // out of the agent's range
    orchestrator
        .handle(AgentReport::StatusSync { status_code: 2100 })
        .await;
    assert_eq!(orchestrator.stage().await, StageCode::AGENT_HANDSHAKE);
    orchestrator
        .handle(AgentReport::StatusSync { status_code: 2300 })
        .await;
    assert_eq!(orchestrator.stage().await, StageCode::LIVE_LOW);
}

#[tokio::test]
async fn test_agent_error_and_revive() {
    let cloud = MockCloud::with_state(|s| s.instances.push(running("ins-3")));
    let harness = Harness::new(cloud.clone()).await;
    persist_stage(&harness, StageCode::LIVE_LOW).await;
    persist_instance(
        &harness,
        InstanceDetail {
            instance_id: Some("ins-3".to_string()),
            instance_ip: Some(AGENT_HOST.to_string()),
            key_pair_id: None,
        },
    )
    .await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;

    orchestrator
        .handle(AgentReport::LogSync(LogSync {
            level: "error".to_string(),
            msg: "server crashed".to_string(),
            time: None,
            error: true,
        }))
        .await;
    let status = orchestrator.status().await;
    assert_eq!(status.stage_code, StageCode(1300));
    assert_eq!(status.error_source, ErrorSource::Agent);

    // ignored while in error
    orchestrator
        .handle(AgentReport::StatusSync { status_code: 2400 })
        .await;
    assert_eq!(orchestrator.stage().await, StageCode(1300));

    assert_eq!(orchestrator.revive().await.unwrap(), StageCode::LIVE_LOW);
    orchestrator.join().await;

    // the agent is gone, so supervision ended and cleaned up
    assert_eq!(orchestrator.stage().await, StageCode::IDLE);
    assert_eq!(cloud.terminated(), vec!["ins-3".to_string()]);
}

#[tokio::test]
async fn test_commands_queue_until_live() {
    let harness = Harness::new(MockCloud::with_state(|_| {})).await;
    let orchestrator = harness.open(fast_options(closed_port().await)).await;

    assert_eq!(
        orchestrator.send_command("say hello").await.unwrap(),
        CommandOutcome::Queued
    );
    assert_eq!(
        orchestrator.pending_commands().await.unwrap(),
        vec!["say hello".to_string()]
    );
}

#[tokio::test]
async fn test_agent_revive_after_restart_reaches_agent() {
    let cloud = MockCloud::with_state(|s| s.instances.push(running("ins-4")));
    let harness = Harness::new(cloud.clone()).await;
    let record = StatusRecord {
        stage_code: StageCode(1300),
        message: "Fatal: server crashed".to_string(),
        error_source: ErrorSource::Agent,
        last_error: "server crashed".to_string(),
        ..Default::default()
    };
    harness.layout.status_file().write_json(&record).await.unwrap();
    persist_instance(
        &harness,
        InstanceDetail {
            instance_id: Some("ins-4".to_string()),
            instance_ip: Some(AGENT_HOST.to_string()),
            key_pair_id: None,
        },
    )
    .await;
    let (listener, port) = agent_listener().await;
    let orchestrator = harness.open(fast_options(port)).await;

    assert_eq!(orchestrator.revive().await.unwrap(), StageCode::LIVE_LOW);

    let mut ws = accept_agent(&listener).await;
    let handshake = next_frame(&mut ws).await;
    assert_eq!(handshake["action"], "status_sync");
    let revive = next_frame(&mut ws).await;
    assert_eq!(revive["action"], "revive");
    assert_eq!(revive["key"], handshake["key"]);
    assert!(!orchestrator.channel().revive_pending());

    // keyed with the secret delivered to the instance after the restart
    let uploads = harness.transport.uploads();
    let (_, content) = uploads.last().unwrap();
    let config: Value = serde_json::from_str(content).unwrap();
    assert_eq!(config["secret_key"], revive["key"]);

    close_normally(&mut ws).await;
    orchestrator.join().await;
    assert_eq!(orchestrator.stage().await, StageCode::IDLE);
}

#[tokio::test]
async fn test_reclaim_cancels_live_supervision() {
    let cloud = MockCloud::with_state(|s| s.instances.push(running("ins-5")));
    let harness = Harness::new(cloud.clone()).await;
    persist_stage(&harness, StageCode::LIVE_LOW).await;
    persist_instance(
        &harness,
        InstanceDetail {
            instance_id: Some("ins-5".to_string()),
            instance_ip: Some(AGENT_HOST.to_string()),
            key_pair_id: None,
        },
    )
    .await;
    let (listener, port) = agent_listener().await;
    let orchestrator = harness.open(fast_options(port)).await;

    assert!(orchestrator.resume().await.unwrap());
    let mut ws = accept_agent(&listener).await;
    assert_eq!(next_frame(&mut ws).await["action"], "status_sync");
    assert!(orchestrator.is_running().await);

    assert_eq!(orchestrator.reclaim().await.unwrap(), CleanupOutcome::Cleaned);

    assert!(!orchestrator.is_running().await);
    let status = orchestrator.status().await;
    assert_eq!(status.stage_code, StageCode::IDLE);
    assert!(status.last_error.is_empty());
    assert_eq!(status.error_source, ErrorSource::None);
    assert_eq!(cloud.terminated(), vec!["ins-5".to_string()]);
    assert!(!orchestrator.channel().has_secret().await);
}
