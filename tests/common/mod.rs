//! Shared utilities for integration tests.
//!
//! Starts an in-process server on an ephemeral port, backed by the memory
//! broker, and provides event-capturing client handlers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use juggler::broker::{CalleeBroker, MemoryBroker};
use juggler::client::{ClientEvent, ClientHandler};
use juggler::config::Config;
use juggler::metrics::Metrics;
use juggler::msg::ResPayload;
use juggler::server::Server;

/// Client handler that forwards every event into a channel.
pub struct CapturingHandler {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientHandler for CapturingHandler {
    fn handle(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn capturing_handler() -> (Arc<CapturingHandler>, mpsc::UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(CapturingHandler { tx }), rx)
}

/// A running server plus handles on its broker and counters.
pub struct TestServer {
    pub addr: SocketAddr,
    pub broker: Arc<MemoryBroker>,
    pub metrics: Arc<Metrics>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(|s| s).await
}

pub async fn start_server_with(customize: impl FnOnce(Server) -> Server) -> TestServer {
    let metrics = Arc::new(Metrics::new());
    let config = Config::default();
    let broker = Arc::new(MemoryBroker::new(config.broker.clone(), metrics.clone()));

    let server = customize(Server::new(
        broker.clone(),
        broker.clone(),
        &config,
        metrics.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::new(server).serve(listener));

    TestServer {
        addr,
        broker,
        metrics,
    }
}

/// A callee that answers every call on `uri` by echoing its arguments.
pub fn spawn_echo_callee(broker: Arc<MemoryBroker>, uri: &str) {
    let uris = vec![uri.to_string()];
    tokio::spawn(async move {
        let conn = broker.calls_conn(&uris).await.unwrap();
        let stream = conn.calls();
        while let Some(cp) = stream.recv().await {
            let args = cp.args.clone();
            let rp = ResPayload::for_call(&cp, args);
            if broker.result(rp, Duration::from_secs(5)).await.is_err() {
                break;
            }
        }
    });
}

/// The next event, or a panic after two seconds.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("event channel closed")
}

/// Whatever arrived within the window, without waiting further.
pub async fn drain_events(
    rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    window: Duration,
) -> Vec<ClientEvent> {
    tokio::time::sleep(window).await;
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}
