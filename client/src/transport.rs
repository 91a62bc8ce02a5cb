use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Weak},
};

use futures_util::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SyncConfig,
    error::{ProtocolError, TransportError},
    protocol::{decode_frame, ClientMessage, MessageKind, ServerMessage},
};

const LOG_TAG: &str = "[Transport]";

/// Telemetry attached to each heartbeat
pub trait HeartbeatSource: Send + Sync {
    /// Local playback position, if it is worth reporting right now
    fn heartbeat_time(&self) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    /// Reconnect budget spent; nothing more will be attempted
    Failed,
}

type Handler = Arc<dyn Fn(ServerMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Realtime duplex channel to the room server with bounded reconnects
pub struct TransportChannel {
    inner: Arc<ChannelState>,
}

struct ChannelState {
    config: Arc<SyncConfig>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    handlers: Mutex<HashMap<MessageKind, Handler>>,
    heartbeat: Mutex<Option<Weak<dyn HeartbeatSource>>>,
    status: watch::Sender<ConnectionStatus>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Aborts the wrapped task when dropped
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl TransportChannel {
    pub fn new(config: Arc<SyncConfig>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Closed);
        Self {
            inner: Arc::new(ChannelState {
                config,
                outbound: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
                heartbeat: Mutex::new(None),
                status,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Open the channel and keep it open. Resolves on the first successful
    /// open, or fails once `max_reconnect_attempts` consecutive attempts
    /// have failed.
    pub async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let (opened_tx, opened_rx) = oneshot::channel();
        let task = tokio::spawn(run_connection_loop(
            Arc::clone(&self.inner),
            url.to_string(),
            opened_tx,
        ));
        if let Some(previous) = self.inner.supervisor.lock().replace(task) {
            previous.abort();
        }
        opened_rx.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Fire-and-forget send; dropped when the channel is not open
    pub fn send(&self, message: &ClientMessage) {
        self.inner.send(message);
    }

    /// Register the handler for one message kind, replacing any earlier one
    pub fn on_message<F, Fut>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(ServerMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message| handler(message).boxed());
        if self.inner.handlers.lock().insert(kind, handler).is_some() {
            debug!("{LOG_TAG} replaced handler for {kind:?}");
        }
    }

    pub fn set_heartbeat_source(&self, source: Arc<dyn HeartbeatSource>) {
        *self.inner.heartbeat.lock() = Some(Arc::downgrade(&source));
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_open(&self) -> bool {
        *self.inner.status.borrow() == ConnectionStatus::Open
    }

    /// Shut the channel down for good; no reconnect follows
    pub fn close(&self) {
        if let Some(task) = self.inner.supervisor.lock().take() {
            task.abort();
        }
        self.inner.outbound.lock().take();
        self.inner.set_status(ConnectionStatus::Closed);
        info!("{LOG_TAG} channel closed");
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(task) = self.inner.supervisor.lock().take() {
            task.abort();
        }
    }
}

impl ChannelState {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn send(&self, message: &ClientMessage) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!("{LOG_TAG} failed to encode outbound message: {e}");
                return;
            }
        };
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if *self.status.borrow() == ConnectionStatus::Open => {
                if tx.send(WsMessage::Text(json.into())).is_err() {
                    debug!("{LOG_TAG} writer gone, dropped outbound message");
                }
            }
            _ => debug!("{LOG_TAG} not connected, dropped outbound message"),
        }
    }

    async fn dispatch(&self, text: &str) {
        let message = match decode_frame(text) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(tag)) => {
                warn!("{LOG_TAG} unknown message type '{tag}', dropping");
                return;
            }
            Err(e) => {
                warn!("{LOG_TAG} dropping frame: {e}");
                return;
            }
        };
        let kind = message.kind();
        if kind == MessageKind::Pong {
            return;
        }
        let handler = self.handlers.lock().get(&kind).cloned();
        match handler {
            Some(handler) => handler(message).await,
            None => debug!("{LOG_TAG} no handler for {kind:?}"),
        }
    }

    /// Pump one open connection until it closes
    async fn serve(self: &Arc<Self>, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.outbound.lock() = Some(tx.clone());

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("{LOG_TAG} write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });
        let _heartbeat = TaskGuard(tokio::spawn(heartbeat_loop(Arc::clone(self), tx)));

        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.dispatch(text.as_str()).await,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("{LOG_TAG} read failed: {e}");
                    break;
                }
            }
        }

        self.outbound.lock().take();
    }
}

async fn run_connection_loop(
    state: Arc<ChannelState>,
    url: String,
    opened: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut opened = Some(opened);
    let mut failures: u32 = 0;
    let max_attempts = state.config.max_reconnect_attempts.max(1);

    loop {
        state.set_status(ConnectionStatus::Connecting);
        let handshake = time::timeout(state.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| format!("no handshake within {:?}", state.config.connect_timeout))
            .and_then(|result| result.map_err(|e| e.to_string()));
        match handshake {
            Ok((stream, _)) => {
                failures = 0;
                info!("{LOG_TAG} connected to {url}");
                state.set_status(ConnectionStatus::Open);
                if let Some(tx) = opened.take() {
                    let _ = tx.send(Ok(()));
                }
                state.serve(stream).await;
                state.set_status(ConnectionStatus::Closed);
                warn!("{LOG_TAG} connection to {url} lost");
            }
            Err(e) => {
                failures += 1;
                warn!("{LOG_TAG} connect to {url} failed (attempt {failures}/{max_attempts}): {e}");
                if failures >= max_attempts {
                    error!("{LOG_TAG} giving up on {url} after {failures} attempts");
                    state.set_status(ConnectionStatus::Failed);
                    if let Some(tx) = opened.take() {
                        let _ = tx.send(Err(TransportError::ReconnectExhausted {
                            attempts: failures,
                        }));
                    }
                    return;
                }
            }
        }
        time::sleep(state.config.reconnect_delay).await;
    }
}

async fn heartbeat_loop(state: Arc<ChannelState>, tx: mpsc::UnboundedSender<WsMessage>) {
    let period = state.config.heartbeat_interval;
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let source = state.heartbeat.lock().as_ref().and_then(Weak::upgrade);
        let current_time = source.and_then(|s| s.heartbeat_time());
        let ping = ClientMessage::Ping { current_time };
        let Ok(json) = serde_json::to_string(&ping) else {
            continue;
        };
        if tx.send(WsMessage::Text(json.into())).is_err() {
            break;
        }
    }
}
