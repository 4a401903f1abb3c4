//! Per-connection engine.
//!
//! Ownership is one-way: the connection owns its pumps and its writer, and
//! pumps reach the writer only through its queue. The writer task holds the
//! sole right to the transport's write half, so outbound frames never
//! interleave; the demux enqueues the ACK for a call before the results path
//! is released, which keeps ACK-before-RES ordering even when a callee
//! answers instantly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, MsgStream, PubSubConn, ResultsConn};
use crate::msg::{
    self, nack_code, AuthPayload, CallPayload, CallRequest, EvntPayload, Meta, Msg, ProtoError,
    PubPayload, PubRequest, ResPayload,
};

use super::{Direction, Server};

/// Consecutive decode failures tolerated before the connection is closed.
const MAX_DECODE_ERRORS: u32 = 3;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

enum OutFrame {
    Msg(Msg),
    Close { code: CloseCode, reason: String },
}

struct PendingCall {
    deadline: Instant,
    /// The ACK for this call has been enqueued to the writer.
    acked: bool,
    /// Results that raced ahead of the ACK, released once it is enqueued.
    buffered: Vec<ResPayload>,
}

struct ConnState {
    uuid: Uuid,
    server: Arc<Server>,
    writer_tx: mpsc::Sender<OutFrame>,
    handler_tx: Option<mpsc::Sender<(Direction, Msg)>>,
    pending: std::sync::Mutex<HashMap<Uuid, PendingCall>>,
    results: OnceCell<ResultsConn>,
    results_pump_started: AtomicBool,
    pubsub: OnceCell<PubSubConn>,
    pubsub_pump_started: AtomicBool,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

/// Run the engine for one accepted websocket connection.
pub(super) async fn run(server: Arc<Server>, ws: WebSocketStream<TcpStream>, peer: SocketAddr) {
    let uuid = Uuid::new_v4();
    let (sink, stream) = ws.split();
    let (writer_tx, writer_rx) = mpsc::channel(server.config.writer_queue_capacity);
    let (close_tx, _) = watch::channel(false);

    let handler_tx = server.handler.clone().map(|handler| {
        let (tx, mut rx) = mpsc::channel::<(Direction, Msg)>(server.config.handler_queue_capacity);
        tokio::spawn(async move {
            while let Some((direction, m)) = rx.recv().await {
                handler.handle(uuid, direction, &m);
            }
        });
        tx
    });

    let state = Arc::new(ConnState {
        uuid,
        server,
        writer_tx,
        handler_tx,
        pending: std::sync::Mutex::new(HashMap::new()),
        results: OnceCell::new(),
        results_pump_started: AtomicBool::new(false),
        pubsub: OnceCell::new(),
        pubsub_pump_started: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        close_tx,
    });

    state.server.metrics.record_connection_opened();
    info!(conn_uuid = %uuid, peer = %peer, "connection accepted");

    // subscribe every task before any of them can trigger a shutdown
    let writer_close_rx = state.close_tx.subscribe();
    let sweeper_close_rx = state.close_tx.subscribe();
    let reader_close_rx = state.close_tx.subscribe();

    tokio::spawn(writer_task(state.clone(), sink, writer_rx, writer_close_rx));
    tokio::spawn(sweeper_task(state.clone(), sweeper_close_rx));

    reader_loop(&state, stream, reader_close_rx).await;
    state.shutdown(CloseCode::Away, "").await;
    debug!(conn_uuid = %uuid, "connection engine stopped");
}

// ---------------------------------------------------------------------------
// Reader / demux
// ---------------------------------------------------------------------------

async fn reader_loop(
    state: &Arc<ConnState>,
    mut stream: WsStream,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut decode_errors = 0u32;

    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            frame = stream.next() => {
                let Some(frame) = frame else {
                    state.shutdown(CloseCode::Away, "peer disconnected").await;
                    break;
                };
                match frame {
                    Ok(Message::Text(text)) => {
                        if !process_frame(state, &text, &mut decode_errors).await {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if !process_frame(state, &text, &mut decode_errors).await {
                                break;
                            }
                        }
                        Err(_) => {
                            let err =
                                ProtoError::MalformedFrame("frame is not valid UTF-8".into());
                            if !note_decode_error(state, &mut decode_errors, err).await {
                                break;
                            }
                        }
                    },
                    Ok(Message::Close(_)) => {
                        state.shutdown(CloseCode::Away, "peer closed").await;
                        break;
                    }
                    // ping/pong are handled by the transport
                    Ok(_) => {}
                    Err(e) => {
                        debug!(conn_uuid = %state.uuid, error = %e, "transport read failed");
                        state.shutdown(CloseCode::Away, "read error").await;
                        break;
                    }
                }
            }
        }
    }
}

/// Decode and dispatch one frame; returns whether to keep reading.
async fn process_frame(state: &Arc<ConnState>, raw: &str, decode_errors: &mut u32) -> bool {
    match msg::decode(raw) {
        Ok(m) => {
            *decode_errors = 0;
            if !dispatch(state, &m).await {
                return false;
            }
            state.notify_handler(Direction::Inbound, &m).await;
            true
        }
        Err(e) => note_decode_error(state, decode_errors, e).await,
    }
}

async fn note_decode_error(
    state: &Arc<ConnState>,
    decode_errors: &mut u32,
    err: ProtoError,
) -> bool {
    *decode_errors += 1;
    if !state
        .send_out(Msg::nack_undecodable(err.nack_code(), err.to_string()))
        .await
    {
        return false;
    }
    if *decode_errors >= MAX_DECODE_ERRORS {
        warn!(
            conn_uuid = %state.uuid,
            errors = *decode_errors,
            "consecutive decode errors, closing connection"
        );
        state.shutdown(CloseCode::Protocol, "protocol error").await;
        return false;
    }
    true
}

async fn dispatch(state: &Arc<ConnState>, m: &Msg) -> bool {
    match m {
        Msg::Auth { meta, payload } => handle_auth(state, meta, payload).await,
        Msg::Call { meta, payload } => handle_call(state, meta, payload).await,
        Msg::Pub { meta, payload } => handle_pub(state, meta, payload).await,
        Msg::Sub { meta, payload } => {
            handle_subscription(state, meta, &payload.channel, payload.pattern, true).await
        }
        Msg::Unsb { meta, payload } => {
            handle_subscription(state, meta, &payload.channel, payload.pattern, false).await
        }
        other => {
            let meta = other.meta();
            state
                .send_out(Msg::nack(
                    meta,
                    nack_code::INVALID_PAYLOAD,
                    format!("unexpected {} message", meta.msg_type),
                ))
                .await
        }
    }
}

async fn handle_auth(state: &Arc<ConnState>, meta: &Meta, payload: &AuthPayload) -> bool {
    let Some(authenticator) = &state.server.authenticator else {
        return state.send_out(Msg::ack(meta)).await;
    };
    match authenticator.authenticate(&payload.args).await {
        Ok(()) => state.send_out(Msg::ack(meta)).await,
        Err(reason) => {
            let _ = state
                .send_out(Msg::nack(meta, nack_code::AUTH_FAILED, reason.as_str()))
                .await;
            state
                .shutdown(CloseCode::Policy, "authentication failed")
                .await;
            false
        }
    }
}

async fn handle_call(state: &Arc<ConnState>, meta: &Meta, payload: &CallRequest) -> bool {
    if payload.uri.is_empty() {
        return state
            .send_out(Msg::nack(meta, nack_code::INVALID_PAYLOAD, "empty URI"))
            .await;
    }

    let requested = payload.timeout().unwrap_or(Duration::ZERO);
    let clamped = requested.min(state.server.config.max_call_timeout());
    let effective = state.server.broker_config.effective_call_timeout(clamped);

    let cp = CallPayload::new(meta.uuid, state.uuid, payload.uri.clone(), payload.args.clone());

    // Registered before the submit so a result racing back is gated behind
    // the ACK rather than dropped.
    state.pending.lock().unwrap().insert(
        meta.uuid,
        PendingCall {
            deadline: Instant::now() + effective,
            acked: false,
            buffered: Vec::new(),
        },
    );

    let limit = state.server.broker_config.blocking_timeout();
    match submit(state.server.caller.call(cp, clamped), limit).await {
        Ok(()) => {
            state.server.metrics.record_call_submitted();
            if !state.send_out(Msg::ack(meta)).await {
                return false;
            }

            let buffered = {
                let mut pending = state.pending.lock().unwrap();
                match pending.get_mut(&meta.uuid) {
                    Some(p) => {
                        p.acked = true;
                        std::mem::take(&mut p.buffered)
                    }
                    None => Vec::new(),
                }
            };
            if !buffered.is_empty() {
                state.pending.lock().unwrap().remove(&meta.uuid);
                for rp in buffered {
                    if !state.deliver_result(rp).await {
                        return false;
                    }
                }
            }

            state.ensure_results_pump().await
        }
        Err(e) => {
            state.pending.lock().unwrap().remove(&meta.uuid);
            state
                .send_out(Msg::nack(meta, broker_nack_code(&e), e.to_string()))
                .await
        }
    }
}

async fn handle_pub(state: &Arc<ConnState>, meta: &Meta, payload: &PubRequest) -> bool {
    let pp = PubPayload {
        msg_uuid: meta.uuid,
        channel: payload.channel.clone(),
        args: payload.args.clone(),
    };
    let limit = state.server.broker_config.blocking_timeout();
    match submit(state.server.pubsub.publish(&payload.channel, pp), limit).await {
        Ok(()) => state.send_out(Msg::ack(meta)).await,
        Err(e) => {
            state
                .send_out(Msg::nack(meta, broker_nack_code(&e), e.to_string()))
                .await
        }
    }
}

async fn handle_subscription(
    state: &Arc<ConnState>,
    meta: &Meta,
    channel: &str,
    pattern: bool,
    subscribe: bool,
) -> bool {
    let conn = match state.pubsub_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            return state
                .send_out(Msg::nack(meta, broker_nack_code(&e), e.to_string()))
                .await;
        }
    };

    let outcome = if subscribe {
        conn.subscribe(channel, pattern).await
    } else {
        conn.unsubscribe(channel, pattern).await
    };

    match outcome {
        Ok(()) => {
            state.ensure_pubsub_pump();
            state.send_out(Msg::ack(meta)).await
        }
        Err(e) => {
            state
                .send_out(Msg::nack(meta, broker_nack_code(&e), e.to_string()))
                .await
        }
    }
}

/// Bound a synchronous broker submit; a backend that hangs becomes a
/// [`BrokerError::Timeout`] NACK instead of wedging the demux.
async fn submit<T, F>(fut: F, limit: Duration) -> std::result::Result<T, BrokerError>
where
    F: std::future::Future<Output = std::result::Result<T, BrokerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(outcome) => outcome,
        Err(_) => Err(BrokerError::Timeout("broker submit timed out".into())),
    }
}

fn broker_nack_code(err: &BrokerError) -> i32 {
    match err {
        BrokerError::Timeout(_) => nack_code::BROKER_TIMEOUT,
        BrokerError::Proto(_) | BrokerError::InvalidArgument(_) => nack_code::INVALID_PAYLOAD,
        _ => nack_code::BROKER_UNAVAILABLE,
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

impl ConnState {
    /// Enqueue an outbound frame. Overflow is fatal: the connection closes
    /// rather than let a slow peer back the server up.
    async fn send_out(&self, m: Msg) -> bool {
        match self.writer_tx.try_send(OutFrame::Msg(m)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_uuid = %self.uuid, "writer queue overflow, closing connection");
                self.shutdown(CloseCode::Again, "overloaded").await;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn notify_handler(&self, direction: Direction, m: &Msg) {
        if let Some(tx) = &self.handler_tx {
            let _ = tx.send((direction, m.clone())).await;
        }
    }

    async fn deliver_result(&self, rp: ResPayload) -> bool {
        if !self.send_out(Msg::res(&rp)).await {
            return false;
        }
        self.server.metrics.record_result_delivered();
        true
    }

    async fn pubsub_conn(&self) -> Result<&PubSubConn, BrokerError> {
        self.pubsub
            .get_or_try_init(|| self.server.pubsub.pubsub_conn())
            .await
    }

    async fn ensure_results_pump(self: &Arc<Self>) -> bool {
        let conn = match self
            .results
            .get_or_try_init(|| self.server.caller.results_conn(self.uuid))
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(conn_uuid = %self.uuid, error = %e, "cannot open results stream");
                self.shutdown(CloseCode::Away, "results stream unavailable")
                    .await;
                return false;
            }
        };
        if !self.results_pump_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(results_pump(self.clone(), conn.results()));
        }
        true
    }

    fn ensure_pubsub_pump(self: &Arc<Self>) {
        if let Some(conn) = self.pubsub.get() {
            if !self.pubsub_pump_started.swap(true, Ordering::SeqCst) {
                tokio::spawn(pubsub_pump(self.clone(), conn.events()));
            }
        }
    }

    /// Tear the connection down. Idempotent: closes the pumps (and with
    /// them the broker streams), signals the writer to drain, and sends the
    /// transport Close frame.
    async fn shutdown(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(conn_uuid = %self.uuid, reason, "closing connection");
        if let Some(conn) = self.results.get() {
            conn.close();
        }
        if let Some(conn) = self.pubsub.get() {
            conn.close();
        }
        let _ = self.writer_tx.try_send(OutFrame::Close {
            code,
            reason: reason.to_string(),
        });
        let _ = self.close_tx.send(true);
        self.server.metrics.record_connection_closed();
    }
}

// ---------------------------------------------------------------------------
// Pumps
// ---------------------------------------------------------------------------

/// Forward broker results to the writer, honoring the per-call ACK gate.
async fn results_pump(state: Arc<ConnState>, stream: MsgStream<ResPayload>) {
    while let Some(rp) = stream.recv().await {
        let mut to_deliver: Option<ResPayload> = None;
        {
            let mut pending = state.pending.lock().unwrap();
            let awaiting_ack = matches!(pending.get(&rp.for_uuid), Some(p) if !p.acked);
            if awaiting_ack {
                // ACK not yet enqueued: park the result on the entry
                if let Some(p) = pending.get_mut(&rp.for_uuid) {
                    p.buffered.push(rp);
                }
            } else {
                // locally expired entries are still the caller's results
                pending.remove(&rp.for_uuid);
                to_deliver = Some(rp);
            }
        }
        if let Some(rp) = to_deliver {
            if !state.deliver_result(rp).await {
                return;
            }
        }
    }

    if !state.closed.load(Ordering::SeqCst) {
        if let Some(err) = state.results.get().and_then(|c| c.err()) {
            error!(conn_uuid = %state.uuid, error = %err, "results stream failed");
        }
        state.shutdown(CloseCode::Away, "results stream closed").await;
    }
}

/// Forward broker events to the writer.
async fn pubsub_pump(state: Arc<ConnState>, stream: MsgStream<EvntPayload>) {
    while let Some(ep) = stream.recv().await {
        if !state.send_out(Msg::evnt(&ep)).await {
            return;
        }
        state.server.metrics.record_event_delivered();
    }

    if !state.closed.load(Ordering::SeqCst) {
        if let Some(err) = state.pubsub.get().and_then(|c| c.err()) {
            error!(conn_uuid = %state.uuid, error = %err, "event stream failed");
        }
        state.shutdown(CloseCode::Away, "event stream closed").await;
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

async fn writer_task(
    state: Arc<ConnState>,
    mut sink: WsSink,
    mut rx: mpsc::Receiver<OutFrame>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if write_frame(&state, &mut sink, frame).await.is_break() {
                    return;
                }
            }
            _ = close_rx.changed() => {
                // flush what was enqueued ahead of the close
                while let Ok(frame) = rx.try_recv() {
                    if write_frame(&state, &mut sink, frame).await.is_break() {
                        return;
                    }
                }
                let _ = sink.send(close_message(CloseCode::Away, "")).await;
                break;
            }
        }
    }
}

async fn write_frame(
    state: &Arc<ConnState>,
    sink: &mut WsSink,
    frame: OutFrame,
) -> ControlFlow<()> {
    match frame {
        OutFrame::Msg(m) => {
            let raw = match msg::encode(&m) {
                Ok(raw) => raw,
                Err(e) => {
                    error!(conn_uuid = %state.uuid, error = %e, "dropping unencodable frame");
                    return ControlFlow::Continue(());
                }
            };
            if let Err(e) = sink.send(Message::Text(raw)).await {
                debug!(conn_uuid = %state.uuid, error = %e, "transport write failed");
                state.shutdown(CloseCode::Away, "write error").await;
                return ControlFlow::Break(());
            }
            state.notify_handler(Direction::Outbound, &m).await;
            ControlFlow::Continue(())
        }
        OutFrame::Close { code, reason } => {
            let _ = sink.send(close_message(code, &reason)).await;
            ControlFlow::Break(())
        }
    }
}

fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

// ---------------------------------------------------------------------------
// Expiration sweep
// ---------------------------------------------------------------------------

/// Prune pending calls whose deadline has passed without a result. This is
/// advisory bookkeeping: nothing is sent on the wire and the callee side is
/// not cancelled.
async fn sweeper_task(state: Arc<ConnState>, mut close_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(state.server.config.expiration_sweep_interval());
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = tick.tick() => {
                let now = Instant::now();
                let mut expired = 0u64;
                state.pending.lock().unwrap().retain(|call_uuid, p| {
                    if p.deadline <= now && p.acked && p.buffered.is_empty() {
                        debug!(conn_uuid = %state.uuid, call_uuid = %call_uuid, "pending call expired");
                        expired += 1;
                        false
                    } else {
                        true
                    }
                });
                for _ in 0..expired {
                    state.server.metrics.record_call_expired();
                }
            }
        }
    }
}
