//! Per-endpoint connection lifecycle.
//!
//! Each endpoint runs one task that dials, serves the session (lifecycle
//! announcement, heartbeats, inbound actions, broadcast frames) and decides
//! whether to reconnect. `connected` and `retry_count` are only written by
//! that task, under the endpoint's status lock.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use qbridge_core::BoundedQueue;
use qbridge_onebot::{CqCodec, MetaEvent};
use qbridge_qq::OutboundMessage;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::actions::handle_action_frame;
use crate::config::EndpointConfig;
use crate::connector::{FrameSink, WsConnector, WsTransport};

const WRITER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: retries exhausted or the endpoint was stopped.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub retry_count: u32,
}

/// Whether another attempt is allowed after `retry_count` consecutive failures.
pub fn should_retry(max_retries: u32, retry_count: u32) -> bool {
    max_retries == 0 || retry_count <= max_retries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Dropped,
    Stopped,
}

/// Shared collaborators of every endpoint task.
#[derive(Clone)]
pub struct EndpointContext {
    pub connector: Arc<dyn WsConnector>,
    pub outbound: Arc<BoundedQueue<OutboundMessage>>,
    pub codec: Arc<CqCodec>,
}

impl std::fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointContext")
            .field("outbound", &self.outbound.name())
            .finish()
    }
}

#[derive(Debug)]
pub struct Endpoint {
    config: EndpointConfig,
    status: Mutex<EndpointStatus>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    stop: watch::Sender<bool>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            status: Mutex::new(EndpointStatus {
                state: ConnectionState::Disconnected,
                connected: false,
                retry_count: 0,
            }),
            writer: Mutex::new(None),
            stop,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn self_id(&self) -> i64 {
        self.config.self_id
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn status(&self) -> EndpointStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected
    }

    /// Asks the lifecycle task to close the connection and stop for good.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Queues a text frame on the live connection; false when disconnected or backed up.
    pub fn send_frame(&self, frame: String) -> bool {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(writer) = writer.as_ref() else {
            return false;
        };
        match writer.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(endpoint = %self.config.id, "writer backlog full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Connect/serve/reconnect until stopped or out of retries.
    pub async fn run(self: Arc<Self>, context: EndpointContext) {
        let mut stop = self.stop.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            self.update_status(|status| status.state = ConnectionState::Connecting);
            tracing::debug!(endpoint = %self.config.id, url = %self.config.url, "connecting reverse websocket");

            let connected = tokio::select! {
                result = context.connector.connect(&self.config) => Some(result),
                _ = wait_for_stop(&mut stop) => None,
            };
            match connected {
                None => break,
                Some(Ok(transport)) => {
                    let frames = self.open_session();
                    tracing::info!(endpoint = %self.config.id, url = %self.config.url, "reverse websocket connected");
                    let end = self.serve(transport, frames, &context, &mut stop).await;
                    self.close_session();
                    if end == SessionEnd::Stopped {
                        break;
                    }
                    tracing::warn!(endpoint = %self.config.id, "reverse websocket disconnected");
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        endpoint = %self.config.id,
                        error = %format!("{error:#}"),
                        "reverse websocket connect failed"
                    );
                }
            }

            let retry_count = self.update_status(|status| {
                status.connected = false;
                status.retry_count = status.retry_count.saturating_add(1);
                status.state = ConnectionState::Disconnected;
                status.retry_count
            });
            if !should_retry(self.config.max_retries, retry_count) {
                tracing::error!(
                    endpoint = %self.config.id,
                    retries = self.config.max_retries,
                    "reverse websocket retries exhausted"
                );
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_delay()) => {}
                _ = wait_for_stop(&mut stop) => break,
            }
        }

        self.update_status(|status| {
            status.connected = false;
            status.state = ConnectionState::Stopped;
        });
        tracing::info!(endpoint = %self.config.id, "reverse websocket endpoint stopped");
    }

    fn open_session(&self) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel(WRITER_CAPACITY);
        *self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sender);
        self.update_status(|status| {
            status.retry_count = 0;
            status.connected = true;
            status.state = ConnectionState::Connected;
        });
        receiver
    }

    fn close_session(&self) {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.update_status(|status| status.connected = false);
    }

    async fn serve(
        &self,
        transport: WsTransport,
        mut frames: mpsc::Receiver<String>,
        context: &EndpointContext,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let WsTransport {
            mut sink,
            mut stream,
        } = transport;
        let endpoint_id = self.config.id.as_str();

        if !send_json(&mut sink, &MetaEvent::lifecycle_connect(self.config.self_id)).await {
            return SessionEnd::Dropped;
        }
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = wait_for_stop(stop) => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Stopped;
                }
                inbound = stream.next() => {
                    let message = match inbound {
                        Some(Ok(message)) => message,
                        Some(Err(error)) => {
                            tracing::warn!(endpoint = endpoint_id, error = %error, "reverse websocket read failed");
                            return SessionEnd::Dropped;
                        }
                        None => return SessionEnd::Dropped,
                    };
                    let text = match message {
                        WsMessage::Text(text) => text.as_str().to_string(),
                        WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                tracing::warn!(endpoint = endpoint_id, "dropping non-utf8 binary frame");
                                continue;
                            }
                        },
                        WsMessage::Ping(payload) => {
                            if sink.send(WsMessage::Pong(payload)).await.is_err() {
                                return SessionEnd::Dropped;
                            }
                            continue;
                        }
                        WsMessage::Close(_) => return SessionEnd::Dropped,
                        WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                    };
                    if let Some(response) =
                        handle_action_frame(endpoint_id, &text, &context.codec, &context.outbound)
                    {
                        if !send_json(&mut sink, &response).await {
                            return SessionEnd::Dropped;
                        }
                    }
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return SessionEnd::Dropped;
                    };
                    if let Err(error) = sink.send(WsMessage::Text(frame.into())).await {
                        tracing::warn!(endpoint = endpoint_id, error = %error, "reverse websocket write failed");
                        return SessionEnd::Dropped;
                    }
                }
                _ = heartbeat.tick() => {
                    let frame = MetaEvent::heartbeat(self.config.self_id, self.config.heartbeat_interval_ms);
                    if !send_json(&mut sink, &frame).await {
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }

    fn update_status<T>(&self, update: impl FnOnce(&mut EndpointStatus) -> T) -> T {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut status)
    }
}

async fn send_json<T: Serialize>(sink: &mut FrameSink, value: &T) -> bool {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(error) => {
            tracing::error!(error = %error, "failed to encode frame");
            return true;
        }
    };
    match sink.send(WsMessage::Text(text.into())).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(error = %error, "reverse websocket write failed");
            false
        }
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
