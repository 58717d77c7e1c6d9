//! Agent control channel
//!
//! The control plane dials the agent over WebSocket once the instance has a
//! public address. Every outbound frame carries the per-deployment secret and
//! at most one frame is in flight. The agent originates pings; a connection
//! that stays silent for longer than the ping timeout plus one second is
//! dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agent_protocol::{AgentReport, ControlRequest, Envelope};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::errors::ControlError;
use crate::utils::wait_stopped;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Channel options
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Port the agent listens on
    pub port: u16,

    /// Longest silence between two agent pings, one second of slack is added
    pub ping_timeout: Duration,

    pub connect_timeout: Duration,

    pub reconnect_delay: Duration,

    /// Consecutive failed connections tolerated before the agent is given up
    pub max_reconnect_attempts: u32,

    /// How often a pending send checks for a connection
    pub send_poll_interval: Duration,

    /// Longest a send waits for a connection
    pub send_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            port: 2333,
            ping_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            send_poll_interval: Duration::from_millis(500),
            send_timeout: Duration::from_secs(60),
        }
    }
}

/// Receives the decoded reports of the agent
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, report: AgentReport);
}

/// Why supervision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionEnd {
    /// The agent closed the connection normally
    Closed,
    /// Reconnection attempts ran out
    AgentGone,
    /// The stop signal was raised
    Cancelled,
}

#[derive(Debug)]
enum SessionEnd {
    NormalClose,
    Cancelled,
    Lost(String),
}

pub struct AgentChannel {
    options: ChannelOptions,
    secret: RwLock<Option<SecretString>>,
    sink: Mutex<Option<WsSink>>,
    /// `revive` goes out after the next handshake
    revive_pending: AtomicBool,
}

impl AgentChannel {
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            options,
            secret: RwLock::new(None),
            sink: Mutex::new(None),
            revive_pending: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Secret of the current deployment
    pub async fn set_secret(&self, secret: SecretString) {
        *self.secret.write().await = Some(secret);
    }

    /// Forget the secret and anything pending for the deployment
    pub async fn reset(&self) {
        *self.secret.write().await = None;
        self.revive_pending.store(false, Ordering::SeqCst);
    }

    pub async fn has_secret(&self) -> bool {
        self.secret.read().await.is_some()
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    async fn key_matches(&self, key: &str) -> bool {
        match self.secret.read().await.as_ref() {
            Some(secret) => secret.expose_secret() == key,
            None => false,
        }
    }

    async fn frame(&self, request: &ControlRequest) -> Result<String, ControlError> {
        let secret = self.secret.read().await;
        let secret = secret.as_ref().ok_or_else(|| {
            ControlError::ChannelError("no secret for the current deployment".to_string())
        })?;
        Ok(request.to_envelope(secret.expose_secret()).to_json()?)
    }

    /// Send a request, waiting a bounded time for a connection
    ///
    /// The frame is keyed when it goes out, so a send that waited through a
    /// reconnect carries the secret of the new session.
    pub async fn send(&self, request: &ControlRequest) -> Result<(), ControlError> {
        if !self.has_secret().await {
            return Err(ControlError::ChannelError(
                "no secret for the current deployment".to_string(),
            ));
        }

        let deadline = Instant::now() + self.options.send_timeout;
        loop {
            {
                let mut sink = self.sink.lock().await;
                if let Some(ws) = sink.as_mut() {
                    let frame = self.frame(request).await?;
                    debug!("Sending {} to the agent", request.action());
                    return match ws.send(Message::Text(frame.into())).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            *sink = None;
                            Err(ControlError::ChannelError(format!(
                                "failed to send {}: {}",
                                request.action(),
                                e
                            )))
                        }
                    };
                }
            }

            if Instant::now() >= deadline {
                return Err(ControlError::ChannelUnavailable(self.options.send_timeout));
            }
            tokio::time::sleep(self.options.send_poll_interval).await;
        }
    }

    /// Ask the agent to revive
    ///
    /// Sent right away on a live connection, otherwise after the next
    /// handshake. A failed send stays pending.
    pub async fn request_revive(&self) -> Result<(), ControlError> {
        self.revive_pending.store(true, Ordering::SeqCst);
        if self.is_connected().await {
            self.send_pending_revive().await?;
        }
        Ok(())
    }

    pub fn revive_pending(&self) -> bool {
        self.revive_pending.load(Ordering::SeqCst)
    }

    async fn send_pending_revive(&self) -> Result<(), ControlError> {
        if !self.revive_pending.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.send(&ControlRequest::Revive).await {
            self.revive_pending.store(true, Ordering::SeqCst);
            return Err(e);
        }
        info!("Revive sent to the agent");
        Ok(())
    }

    /// Keep a connection to the agent at `host` until it goes away
    ///
    /// A normal close ends supervision. Any other close or a failed connect is
    /// retried after the reconnect delay until the attempts run out.
    pub async fn supervise(
        &self,
        host: &str,
        handler: &dyn InboundHandler,
        stop: &mut watch::Receiver<bool>,
    ) -> SupervisionEnd {
        let url = format!("ws://{}:{}", host, self.options.port);
        let mut failures = 0u32;

        loop {
            if *stop.borrow() {
                return SupervisionEnd::Cancelled;
            }

            info!("Connecting to the agent: {}", url);
            let connection = tokio::select! {
                result = tokio::time::timeout(self.options.connect_timeout, connect_async(url.as_str())) => result,
                _ = wait_stopped(stop) => return SupervisionEnd::Cancelled,
            };

            match connection {
                Ok(Ok((ws_stream, _))) => {
                    info!("Connected to the agent at {}", url);
                    failures = 0;
                    match self.session(ws_stream, handler, stop).await {
                        SessionEnd::NormalClose => {
                            info!("Agent closed the connection");
                            return SupervisionEnd::Closed;
                        }
                        SessionEnd::Cancelled => return SupervisionEnd::Cancelled,
                        SessionEnd::Lost(reason) => warn!("Lost the agent connection: {}", reason),
                    }
                }
                Ok(Err(e)) => warn!("Failed to connect to the agent: {}", e),
                Err(_) => warn!(
                    "Connecting to the agent timed out after {:?}",
                    self.options.connect_timeout
                ),
            }

            failures += 1;
            if failures > self.options.max_reconnect_attempts {
                warn!(
                    "Agent unreachable after {} reconnect attempts, giving up",
                    self.options.max_reconnect_attempts
                );
                return SupervisionEnd::AgentGone;
            }

            info!(
                "Reconnecting in {:?} ({}/{})",
                self.options.reconnect_delay, failures, self.options.max_reconnect_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = wait_stopped(stop) => return SupervisionEnd::Cancelled,
            }
        }
    }

    fn heartbeat_timeout(&self) -> Duration {
        self.options.ping_timeout + Duration::from_secs(1)
    }

    async fn session(
        &self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        handler: &dyn InboundHandler,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (sink, mut stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);

        match self.send(&ControlRequest::StatusSync).await {
            Ok(()) => {
                if let Err(e) = self.send_pending_revive().await {
                    warn!("Failed to send revive to the agent: {}", e);
                }
            }
            Err(e) => warn!("Handshake with the agent failed: {}", e),
        }

        let heartbeat = tokio::time::sleep(self.heartbeat_timeout());
        tokio::pin!(heartbeat);

        let end = loop {
            tokio::select! {
                _ = wait_stopped(stop) => break SessionEnd::Cancelled,
                _ = &mut heartbeat => {
                    break SessionEnd::Lost(format!("no ping within {:?}", self.heartbeat_timeout()));
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Ping(_))) => {
                        heartbeat.as_mut().reset(Instant::now() + self.heartbeat_timeout());
                    }
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str(), handler).await,
                    Some(Ok(Message::Close(frame))) => {
                        let normal = frame.as_ref().map(|f| f.code == CloseCode::Normal).unwrap_or(false);
                        if normal {
                            break SessionEnd::NormalClose;
                        }
                        break SessionEnd::Lost(format!("closed with {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    None => break SessionEnd::Lost("stream ended".to_string()),
                }
            }
        };

        // sends fail fast from here on
        if let Some(mut sink) = self.sink.lock().await.take() {
            if matches!(end, SessionEnd::Cancelled) {
                let _ = sink.close().await;
            }
        }
        end
    }

    async fn dispatch(&self, text: &str, handler: &dyn InboundHandler) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring frame from the agent: {}", e);
                return;
            }
        };
        if !self.key_matches(&envelope.key).await {
            warn!("Ignoring {} frame with a wrong key", envelope.action);
            return;
        }
        match AgentReport::from_envelope(&envelope) {
            Ok(report) => handler.handle(report).await,
            Err(e) => warn!("Ignoring {} frame: {}", envelope.action, e),
        }
    }
}
