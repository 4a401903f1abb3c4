//! Client library: the caller/publisher side of the bus.
//!
//! A [`Client`] owns one reader task and one writer task over the websocket.
//! It is transparent to server traffic: ACK/NACK/RES/EVNT frames flow to the
//! installed handler uninterpreted, except that RES frames clear the local
//! pending-call bookkeeping. Calls whose deadline passes without a RES get a
//! synthesized, purely local [`ClientEvent::Expired`] notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::msg::{self, Msg, ProtoError};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the client library.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Local expiration notice for a call with no result in time.
///
/// Never sent on the wire; the call may still complete on the callee side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpPayload {
    pub msg_uuid: Uuid,
    pub for_uuid: Uuid,
}

/// What the client hands to the installed handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A frame received from the server.
    Msg(Msg),
    /// A locally synthesized call expiration.
    Expired(ExpPayload),
}

/// Handler for incoming frames and expiration notices.
///
/// Invoked serially from the client's reader task.
pub trait ClientHandler: Send + Sync {
    fn handle(&self, event: ClientEvent);
}

/// Client knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline applied to calls made without a timeout.
    pub default_call_timeout_ms: u64,
    /// Interval of the local expiration sweep.
    pub expiration_sweep_interval_ms: u64,
    /// Outbound frame queue capacity.
    pub outbound_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_call_timeout_ms: 60_000,
            expiration_sweep_interval_ms: 100,
            outbound_queue_capacity: 64,
        }
    }
}

/// A connection to a juggler server.
pub struct Client {
    out_tx: mpsc::Sender<Msg>,
    pending: Arc<Mutex<HashMap<Uuid, Instant>>>,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    default_call_timeout: Duration,
}

impl Client {
    /// Connect to `url` with the default configuration.
    pub async fn dial(url: &str, handler: Arc<dyn ClientHandler>) -> Result<Client> {
        Self::dial_with_config(url, handler, ClientConfig::default()).await
    }

    /// Connect to `url`.
    pub async fn dial_with_config(
        url: &str,
        handler: Arc<dyn ClientHandler>,
        config: ClientConfig,
    ) -> Result<Client> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();

        let (out_tx, out_rx) = mpsc::channel(config.outbound_queue_capacity);
        let (close_tx, _) = watch::channel(false);
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(writer_task(sink, out_rx, close_tx.subscribe()));
        tokio::spawn(reader_task(
            stream,
            handler.clone(),
            pending.clone(),
            closed.clone(),
            close_tx.clone(),
            close_tx.subscribe(),
        ));
        tokio::spawn(sweeper_task(
            pending.clone(),
            handler,
            close_tx.subscribe(),
            Duration::from_millis(config.expiration_sweep_interval_ms),
        ));

        debug!(url, "connected");

        Ok(Client {
            out_tx,
            pending,
            closed,
            close_tx,
            default_call_timeout: Duration::from_millis(config.default_call_timeout_ms),
        })
    }

    /// Send an AUTH message; returns its UUID.
    pub async fn auth(&self, args: Vec<u8>) -> Result<Uuid> {
        self.send(Msg::auth(args)).await
    }

    /// Send a CALL message; returns its UUID for correlating the ACK, the
    /// RES, or the local expiration.
    pub async fn call(&self, uri: &str, args: Vec<u8>, timeout: Option<Duration>) -> Result<Uuid> {
        let m = Msg::call(uri, args, timeout);
        let uuid = m.uuid();

        let deadline = Instant::now()
            + timeout
                .filter(|t| !t.is_zero())
                .unwrap_or(self.default_call_timeout);
        self.pending.lock().unwrap().insert(uuid, deadline);

        match self.send(m).await {
            Ok(uuid) => Ok(uuid),
            Err(e) => {
                self.pending.lock().unwrap().remove(&uuid);
                Err(e)
            }
        }
    }

    /// Send a PUB message; returns its UUID.
    pub async fn publish(&self, channel: &str, args: Vec<u8>) -> Result<Uuid> {
        self.send(Msg::publish(channel, args)).await
    }

    /// Send a SUB message; returns its UUID.
    pub async fn subscribe(&self, channel: &str, pattern: bool) -> Result<Uuid> {
        self.send(Msg::sub(channel, pattern)).await
    }

    /// Send an UNSB message; returns its UUID.
    pub async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<Uuid> {
        self.send(Msg::unsb(channel, pattern)).await
    }

    async fn send(&self, m: Msg) -> Result<Uuid> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let uuid = m.uuid();
        self.out_tx.send(m).await.map_err(|_| ClientError::Closed)?;
        Ok(uuid)
    }

    /// Whether the connection has closed (either side).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection, sending a websocket Close frame. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.close_tx.send(true);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

type ClientSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type ClientStream = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn writer_task(
    mut sink: ClientSink,
    mut rx: mpsc::Receiver<Msg>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            m = rx.recv() => {
                let Some(m) = m else { break };
                let raw = match msg::encode(&m) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(raw)).await {
                    debug!(error = %e, "transport write failed");
                    break;
                }
            }
            _ = close_rx.changed() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "bye".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn reader_task(
    mut stream: ClientStream,
    handler: Arc<dyn ClientHandler>,
    pending: Arc<Mutex<HashMap<Uuid, Instant>>>,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            frame = stream.next() => {
                let Some(frame) = frame else { break };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("discarding non-UTF-8 frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "server closed the connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "transport read failed");
                        break;
                    }
                };

                match msg::decode(&text) {
                    Ok(m) => {
                        if let Msg::Res { payload, .. } = &m {
                            pending.lock().unwrap().remove(&payload.for_uuid);
                        }
                        handler.handle(ClientEvent::Msg(m));
                    }
                    Err(e) => warn!(error = %e, "discarding undecodable frame"),
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    let _ = close_tx.send(true);
}

/// Synthesize [`ClientEvent::Expired`] for calls past their deadline.
async fn sweeper_task(
    pending: Arc<Mutex<HashMap<Uuid, Instant>>>,
    handler: Arc<dyn ClientHandler>,
    mut close_rx: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = tick.tick() => {
                let now = Instant::now();
                let mut expired = Vec::new();
                pending.lock().unwrap().retain(|uuid, deadline| {
                    if *deadline <= now {
                        expired.push(*uuid);
                        false
                    } else {
                        true
                    }
                });
                for for_uuid in expired {
                    handler.handle(ClientEvent::Expired(ExpPayload {
                        msg_uuid: Uuid::new_v4(),
                        for_uuid,
                    }));
                }
            }
        }
    }
}
