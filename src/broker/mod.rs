//! Broker contract: the interfaces a backend must satisfy to shuttle calls,
//! results, and events between callers, callees, and pub/sub participants.
//!
//! This module contains:
//! - Role traits: [`CallerBroker`], [`CalleeBroker`], [`PubSubBroker`]
//! - Streaming connections: [`ResultsConn`], [`CallsConn`], [`PubSubConn`]
//! - Implementations: Redis (reference), in-memory (single-process)
//!
//! Streams are lazy: the first call to `results()`/`calls()`/`events()`
//! starts the background pump; later calls return handles on the same
//! sequence, drained competitively by however many consumers want it.
//! A pump error closes the stream and is reported through `err()`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::msg::{CallPayload, EvntPayload, ProtoError, PubPayload, ResPayload};

pub mod memory;
mod pattern;
mod queue;
pub mod redis;

pub use memory::MemoryBroker;
pub use queue::MsgStream;
pub use self::redis::RedisBroker;

pub(crate) use pattern::glob_match;
pub(crate) use queue::DeliveryQueue;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
///
/// Adapter backends fold their native errors into these; the variants are
/// `Clone` so a pump can both terminate a stream with the root cause and
/// leave it readable behind `err()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker operation timed out: {0}")]
    Timeout(String),

    #[error("URIs span multiple cluster shards: {0}")]
    CrossShard(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl From<::redis::RedisError> for BrokerError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout(e.to_string())
        } else {
            BrokerError::Unavailable(e.to_string())
        }
    }
}

/// Broker in the caller role.
#[async_trait]
pub trait CallerBroker: Send + Sync {
    /// Register a call request. The broker stamps the payload's expiration
    /// from `timeout` (zero falls back to the configured default, floor
    /// 1 ms); past the expiration the call is silently dropped.
    async fn call(&self, cp: CallPayload, timeout: Duration) -> Result<()>;

    /// Open a stream of results destined for the given connection UUID.
    async fn results_conn(&self, conn_uuid: Uuid) -> Result<ResultsConn>;
}

/// Broker in the callee role.
#[async_trait]
pub trait CalleeBroker: Send + Sync {
    /// Open a stream of call requests for the union of the given URIs.
    ///
    /// On a clustered backend, every URI must map to the same shard;
    /// violating that fails immediately with [`BrokerError::CrossShard`].
    async fn calls_conn(&self, uris: &[String]) -> Result<CallsConn>;

    /// Publish a call result, retrievable by the caller connection for at
    /// most `timeout`.
    async fn result(&self, rp: ResPayload, timeout: Duration) -> Result<()>;
}

/// Broker in the pub-sub role.
#[async_trait]
pub trait PubSubBroker: Send + Sync {
    /// Open a subscription-managing connection with its event stream.
    async fn pubsub_conn(&self) -> Result<PubSubConn>;

    /// Publish an event on the channel, fanned out to every matching
    /// subscriber at the moment of publication.
    async fn publish(&self, channel: &str, pp: PubPayload) -> Result<()>;
}

/// Stamp a call payload's expiration from its effective submit timeout.
pub(crate) fn stamp_expiration(cp: &mut CallPayload, timeout: Duration) {
    let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    cp.expires_at = crate::msg::now_ms() + chrono::Duration::milliseconds(millis);
}

/// Closure that spawns a stream's pump once, on first use.
pub(crate) type PumpStarter<T> =
    Box<dyn FnOnce(Arc<DeliveryQueue<T>>, watch::Receiver<bool>) + Send>;

/// Shared mechanics of the three streaming connections: a delivery queue, a
/// lazily started pump, and a prompt shutdown signal.
pub(crate) struct StreamConn<T> {
    queue: Arc<DeliveryQueue<T>>,
    starter: std::sync::Mutex<Option<PumpStarter<T>>>,
    shutdown: watch::Sender<bool>,
}

impl<T> StreamConn<T> {
    pub(crate) fn new(queue: Arc<DeliveryQueue<T>>, starter: PumpStarter<T>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            starter: std::sync::Mutex::new(Some(starter)),
            shutdown,
        }
    }

    fn stream(&self) -> MsgStream<T> {
        if !self.queue.is_closed() {
            if let Some(start) = self.starter.lock().unwrap().take() {
                start(self.queue.clone(), self.shutdown.subscribe());
            }
        }
        MsgStream::new(self.queue.clone())
    }

    fn error(&self) -> Option<BrokerError> {
        self.queue.error()
    }

    fn close(&self) {
        // a pump that never started must not start after close
        self.starter.lock().unwrap().take();
        let _ = self.shutdown.send(true);
        self.queue.close(None);
    }
}

/// Stream of results for one caller connection UUID.
pub struct ResultsConn(pub(crate) StreamConn<ResPayload>);

impl ResultsConn {
    /// The result stream. The first call starts the pump; subsequent calls
    /// return handles on the same sequence.
    pub fn results(&self) -> MsgStream<ResPayload> {
        self.0.stream()
    }

    /// The error that closed the stream; `None` while open or after a clean
    /// close.
    pub fn err(&self) -> Option<BrokerError> {
        self.0.error()
    }

    /// Close the connection. Idempotent; interrupts the pump promptly.
    pub fn close(&self) {
        self.0.close()
    }
}

/// Stream of call requests for a set of URIs.
pub struct CallsConn(pub(crate) StreamConn<CallPayload>);

impl std::fmt::Debug for CallsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallsConn").finish_non_exhaustive()
    }
}

impl CallsConn {
    /// The call-request stream. The first call starts the pump; subsequent
    /// calls return handles on the same sequence.
    pub fn calls(&self) -> MsgStream<CallPayload> {
        self.0.stream()
    }

    /// The error that closed the stream; `None` while open or after a clean
    /// close.
    pub fn err(&self) -> Option<BrokerError> {
        self.0.error()
    }

    /// Close the connection. Idempotent; interrupts the pump promptly.
    pub fn close(&self) {
        self.0.close()
    }
}

/// Backend subscribe/unsubscribe operations behind a [`PubSubConn`].
#[async_trait]
pub(crate) trait SubscriptionOps: Send + Sync {
    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<()>;
    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<()>;
}

/// Subscription-managing connection with an event stream.
pub struct PubSubConn {
    stream: StreamConn<EvntPayload>,
    ops: Box<dyn SubscriptionOps>,
    exact: Arc<Mutex<HashSet<String>>>,
    patterns: Arc<Mutex<HashSet<String>>>,
}

impl PubSubConn {
    pub(crate) fn new(
        stream: StreamConn<EvntPayload>,
        ops: Box<dyn SubscriptionOps>,
        exact: Arc<Mutex<HashSet<String>>>,
        patterns: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        Self {
            stream,
            ops,
            exact,
            patterns,
        }
    }

    /// Subscribe to a channel (or glob pattern). Subscribing to a channel
    /// already in the set is a no-op success.
    pub async fn subscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        let set = if pattern { &self.patterns } else { &self.exact };
        let mut set = set.lock().await;
        if set.contains(channel) {
            return Ok(());
        }
        self.ops.subscribe(channel, pattern).await?;
        set.insert(channel.to_string());
        Ok(())
    }

    /// Unsubscribe from a channel (or glob pattern). Unsubscribing from an
    /// unknown channel is a no-op success.
    pub async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        let set = if pattern { &self.patterns } else { &self.exact };
        let mut set = set.lock().await;
        if !set.contains(channel) {
            return Ok(());
        }
        self.ops.unsubscribe(channel, pattern).await?;
        set.remove(channel);
        Ok(())
    }

    /// The event stream. The first call starts the pump; subsequent calls
    /// return handles on the same sequence.
    pub fn events(&self) -> MsgStream<EvntPayload> {
        self.stream.stream()
    }

    /// The error that closed the stream; `None` while open or after a clean
    /// close.
    pub fn err(&self) -> Option<BrokerError> {
        self.stream.error()
    }

    /// Close the connection. Idempotent; interrupts the pump promptly.
    pub fn close(&self) {
        self.stream.close()
    }
}
