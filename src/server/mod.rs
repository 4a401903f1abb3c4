//! Server engine: websocket accept loop and connection lifecycle.
//!
//! Each accepted transport connection gets a UUID and its own engine (see
//! [`conn`]): one reader task demultiplexing inbound frames, one writer task
//! with the sole right to the transport's write half, and lazily started
//! pumps bridging broker results and events back out.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info};
use uuid::Uuid;

use crate::broker::{CallerBroker, PubSubBroker};
use crate::config::{BrokerConfig, Config, ServerConfig};
use crate::metrics::Metrics;
use crate::msg::Msg;

mod conn;

/// Pluggable AUTH hook.
///
/// Success produces an ACK; failure produces a NACK and closes the
/// connection. When no authenticator is installed, AUTH always succeeds.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate the opaque credential bytes of an AUTH message.
    async fn authenticate(&self, args: &[u8]) -> std::result::Result<(), String>;
}

/// Direction of a message relative to the server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Per-message observation hook.
///
/// Invoked for every inbound message after the demux has acted on it, and
/// for every outbound message after the writer has sent it. Handlers run
/// serially on a per-connection task; a slow handler blocks only its own
/// connection.
pub trait ConnHandler: Send + Sync {
    fn handle(&self, conn_uuid: Uuid, direction: Direction, msg: &Msg);
}

/// The juggler server.
pub struct Server {
    pub(crate) caller: Arc<dyn CallerBroker>,
    pub(crate) pubsub: Arc<dyn PubSubBroker>,
    pub(crate) config: ServerConfig,
    pub(crate) broker_config: BrokerConfig,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) handler: Option<Arc<dyn ConnHandler>>,
    pub(crate) metrics: Arc<Metrics>,
}

impl Server {
    pub fn new(
        caller: Arc<dyn CallerBroker>,
        pubsub: Arc<dyn PubSubBroker>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            caller,
            pubsub,
            config: config.server.clone(),
            broker_config: config.broker.clone(),
            authenticator: None,
            handler: None,
            metrics,
        }
    }

    /// Install the AUTH hook.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Install the per-message observation hook.
    pub fn with_handler(mut self, handler: Arc<dyn ConnHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Accept connections until the listener fails.
    ///
    /// Each websocket handshake that completes gets its own connection
    /// engine; handshake failures are logged and do not stop the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "juggler server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                match accept_async(stream).await {
                    Ok(ws) => conn::run(server, ws, peer).await,
                    Err(e) => {
                        error!(peer = %peer, error = %e, "websocket handshake failed");
                    }
                }
            });
        }
    }
}
