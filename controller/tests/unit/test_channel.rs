//! Agent control channel tests

mod mocks;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_protocol::{AgentReport, ControlRequest};
use async_trait::async_trait;
use futures::SinkExt;
use secrecy::SecretString;
use serde_json::json;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::Message;

use spotforge::channel::{AgentChannel, ChannelOptions, InboundHandler, SupervisionEnd};
use spotforge::deploy::stage::StageCode;
use spotforge::errors::ControlError;
use spotforge::storage::instance::InstanceDetail;
use spotforge::storage::status::StatusRecord;
use spotforge::workers::preemption;

use mocks::*;

const SECRET: &str = "s3cret";

#[derive(Default)]
struct Recorder {
    reports: Mutex<Vec<AgentReport>>,
}

#[async_trait]
impl InboundHandler for Recorder {
    async fn handle(&self, report: AgentReport) {
        self.reports.lock().unwrap().push(report);
    }
}

fn options(port: u16) -> ChannelOptions {
    ChannelOptions {
        port,
        ping_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(10),
        max_reconnect_attempts: 0,
        send_poll_interval: Duration::from_millis(10),
        send_timeout: Duration::from_millis(200),
    }
}

async fn channel(port: u16) -> Arc<AgentChannel> {
    let channel = Arc::new(AgentChannel::new(options(port)));
    channel.set_secret(SecretString::from(SECRET.to_string())).await;
    channel
}

fn supervise(
    channel: Arc<AgentChannel>,
    handler: Arc<Recorder>,
) -> (
    watch::Sender<bool>,
    tokio::task::JoinHandle<SupervisionEnd>,
) {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        channel
            .supervise(AGENT_HOST, handler.as_ref(), &mut stop_rx)
            .await
    });
    (stop_tx, handle)
}

#[tokio::test]
async fn test_send_without_connection_is_bounded() {
    let channel = channel(closed_port().await).await;
    let started = std::time::Instant::now();
    let result = channel.send(&ControlRequest::Stop).await;
    assert!(matches!(result, Err(ControlError::ChannelUnavailable(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_send_without_secret_fails() {
    let channel = AgentChannel::new(options(closed_port().await));
    assert!(matches!(
        channel.send(&ControlRequest::Stop).await,
        Err(ControlError::ChannelError(_))
    ));
}

#[tokio::test]
async fn test_every_frame_carries_the_key() {
    let (listener, port) = agent_listener().await;
    let channel = channel(port).await;
    let recorder = Arc::new(Recorder::default());
    let (_stop, handle) = supervise(channel.clone(), recorder.clone());

    let mut ws = accept_agent(&listener).await;
    let handshake = next_frame(&mut ws).await;
    assert_eq!(handshake["key"], SECRET);
    assert_eq!(handshake["action"], "status_sync");

    channel
        .send(&ControlRequest::Command {
            command: "list".to_string(),
        })
        .await
        .unwrap();
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["key"], SECRET);
    assert_eq!(frame["action"], "command");
    assert_eq!(frame["data"]["command"], "list");

    close_normally(&mut ws).await;
    assert_eq!(handle.await.unwrap(), SupervisionEnd::Closed);
    assert!(!channel.is_connected().await);
}

#[tokio::test]
async fn test_frames_with_wrong_key_are_ignored() {
    let (listener, port) = agent_listener().await;
    let channel = channel(port).await;
    let recorder = Arc::new(Recorder::default());
    let (_stop, handle) = supervise(channel.clone(), recorder.clone());

    let mut ws = accept_agent(&listener).await;
    next_frame(&mut ws).await;

    send_report(&mut ws, "wrong", "status_sync", json!({ "status_code": 2300 })).await;
    ws.send(Message::Text(String::from("not json").into()))
        .await
        .unwrap();
    send_report(&mut ws, SECRET, "players_num", json!({ "online": 3, "max": 20 })).await;
    send_report(&mut ws, SECRET, "idling_time_left", json!({ "time": 300 })).await;

    close_normally(&mut ws).await;
    assert_eq!(handle.await.unwrap(), SupervisionEnd::Closed);

    let reports = recorder.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 2);
    assert!(matches!(reports[0], AgentReport::PlayersNum(_)));
    assert_eq!(reports[1], AgentReport::IdlingTimeLeft { time: 300 });
}

#[tokio::test]
async fn test_pings_keep_the_connection() {
    let (listener, port) = agent_listener().await;
    let channel = channel(port).await;
    let (_stop, handle) = supervise(channel.clone(), Arc::new(Recorder::default()));

    let mut ws = accept_agent(&listener).await;
    next_frame(&mut ws).await;

    // well past the timeout in total, but never silent for long
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        ws.send(Message::Ping(Vec::new().into())).await.unwrap();
    }
    assert!(channel.is_connected().await);

    close_normally(&mut ws).await;
    assert_eq!(handle.await.unwrap(), SupervisionEnd::Closed);
}

#[tokio::test]
async fn test_silent_agent_is_dropped() {
    let (listener, port) = agent_listener().await;
    let channel = channel(port).await;
    let (_stop, handle) = supervise(channel.clone(), Arc::new(Recorder::default()));

    let _ws = accept_agent(&listener).await;
    let end = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    // no reconnect attempts are allowed
    assert_eq!(end, SupervisionEnd::AgentGone);
    assert!(!channel.is_connected().await);
}

#[tokio::test]
async fn test_stop_cancels_supervision() {
    let (listener, port) = agent_listener().await;
    let channel = channel(port).await;
    let (stop, handle) = supervise(channel.clone(), Arc::new(Recorder::default()));

    let mut ws = accept_agent(&listener).await;
    next_frame(&mut ws).await;
    stop.send_replace(true);

    assert_eq!(handle.await.unwrap(), SupervisionEnd::Cancelled);
    assert!(!channel.is_connected().await);
}

#[tokio::test]
async fn test_queued_commands_flush_in_order_once_live() {
    let cloud = MockCloud::with_state(|s| s.instances.push(running("ins-1")));
    let harness = Harness::new(cloud.clone()).await;
    let record = StatusRecord {
        stage_code: StageCode::AGENT_HANDSHAKE,
        message: StageCode::AGENT_HANDSHAKE.describe(),
        ..Default::default()
    };
    harness.layout.status_file().write_json(&record).await.unwrap();
    harness
        .layout
        .instance_details_file()
        .write_json(&InstanceDetail {
            instance_id: Some("ins-1".to_string()),
            instance_ip: Some(AGENT_HOST.to_string()),
            key_pair_id: None,
        })
        .await
        .unwrap();

    let (listener, port) = agent_listener().await;
    let orchestrator = harness.open(fast_options(port)).await;
    orchestrator.send_command("first").await.unwrap();
    orchestrator.send_command("second").await.unwrap();

    assert!(orchestrator.resume().await.unwrap());
    let mut ws = accept_agent(&listener).await;
    let handshake = next_frame(&mut ws).await;
    let key = handshake["key"].as_str().unwrap().to_string();

    send_report(&mut ws, &key, "status_sync", json!({ "status_code": 2300 })).await;
    let first = next_frame(&mut ws).await;
    let second = next_frame(&mut ws).await;
    assert_eq!(first["data"]["command"], "first");
    assert_eq!(second["data"]["command"], "second");
    assert_eq!(first["key"], key.as_str());

    close_normally(&mut ws).await;
    orchestrator.join().await;
    assert!(orchestrator.pending_commands().await.unwrap().is_empty());
    assert_eq!(orchestrator.stage().await, StageCode::IDLE);
}

#[tokio::test]
async fn test_preemption_notice_sends_urgent_stop() {
    let (listener, port) = agent_listener().await;
    let channel = channel(port).await;
    let recorder = Arc::new(Recorder::default());
    let (_stop, handle) = supervise(channel.clone(), recorder.clone());

    let mut ws = accept_agent(&listener).await;
    next_frame(&mut ws).await;

    let cloud = MockCloud::with_state(|s| s.imminent = true);
    let options = preemption::Options {
        interval: Duration::from_millis(10),
    };
    let outcome = preemption::run(
        &options,
        "ins-1",
        cloud.as_ref(),
        channel.as_ref(),
        tokio::time::sleep,
        Box::pin(std::future::pending::<()>()),
    )
    .await;
    assert_eq!(outcome, preemption::Outcome::Preempted);

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["key"], SECRET);
    assert_eq!(frame["action"], "urgent_stop");

    close_normally(&mut ws).await;
    assert_eq!(handle.await.unwrap(), SupervisionEnd::Closed);
}

#[tokio::test]
async fn test_preemption_worker_stops_on_shutdown() {
    let channel = channel(closed_port().await).await;
    let cloud = MockCloud::with_state(|_| {});
    let options = preemption::Options {
        interval: Duration::from_millis(10),
    };
    let outcome = preemption::run(
        &options,
        "ins-1",
        cloud.as_ref(),
        channel.as_ref(),
        tokio::time::sleep,
        Box::pin(tokio::time::sleep(Duration::from_millis(50))),
    )
    .await;
    assert_eq!(outcome, preemption::Outcome::Shutdown);
}

#[tokio::test]
async fn test_dropped_connection_reconnects() {
    let (listener, port) = agent_listener().await;
    let channel = Arc::new(AgentChannel::new(ChannelOptions {
        max_reconnect_attempts: 2,
        ..options(port)
    }));
    channel.set_secret(SecretString::from(SECRET.to_string())).await;
    let recorder = Arc::new(Recorder::default());
    let (_stop, handle) = supervise(channel.clone(), recorder.clone());

    let mut first = accept_agent(&listener).await;
    assert_eq!(next_frame(&mut first).await["action"], "status_sync");
    // gone without a close frame
    drop(first);

    let mut second = accept_agent(&listener).await;
    let handshake = next_frame(&mut second).await;
    assert_eq!(handshake["action"], "status_sync");
    assert_eq!(handshake["key"], SECRET);

    // a normal close is final
    close_normally(&mut second).await;
    assert_eq!(handle.await.unwrap(), SupervisionEnd::Closed);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), listener.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_reconnect_attempts_are_bounded() {
    let (listener, port) = agent_listener().await;
    let accepted = Arc::new(AtomicU32::new(0));
    let acceptor = {
        let accepted = accepted.clone();
        tokio::spawn(async move {
            // refuse the websocket upgrade by hanging up
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        })
    };

    let channel = Arc::new(AgentChannel::new(ChannelOptions {
        max_reconnect_attempts: 3,
        ..options(port)
    }));
    channel.set_secret(SecretString::from(SECRET.to_string())).await;
    let recorder = Arc::new(Recorder::default());
    let (_stop, handle) = supervise(channel, recorder);

    assert_eq!(handle.await.unwrap(), SupervisionEnd::AgentGone);
    // the first connection plus three retries
    assert_eq!(accepted.load(Ordering::SeqCst), 4);
    acceptor.abort();
}

#[tokio::test]
async fn test_revive_waits_for_the_next_handshake() {
    let (listener, port) = agent_listener().await;
    let channel = channel(port).await;
    channel.request_revive().await.unwrap();
    assert!(channel.revive_pending());

    // rotated before the connection comes up
    channel
        .set_secret(SecretString::from("rotated".to_string()))
        .await;
    let recorder = Arc::new(Recorder::default());
    let (_stop, handle) = supervise(channel.clone(), recorder);

    let mut ws = accept_agent(&listener).await;
    assert_eq!(next_frame(&mut ws).await["action"], "status_sync");
    let revive = next_frame(&mut ws).await;
    assert_eq!(revive["action"], "revive");
    assert_eq!(revive["key"], "rotated");
    assert!(!channel.revive_pending());

    close_normally(&mut ws).await;
    assert_eq!(handle.await.unwrap(), SupervisionEnd::Closed);
}
