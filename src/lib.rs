//! Juggler - websocket message bus
//!
//! A bidirectional RPC and pub/sub bus: clients send calls and
//! subscriptions over a websocket, callees pull call requests from URI
//! queues through the broker and post results back, and published events
//! fan out to every matching subscriber.

pub mod broker;
pub mod client;
pub mod config;
pub mod metrics;
pub mod msg;
pub mod server;

// Re-export common types for library usage
pub use broker::{
    BrokerError, CalleeBroker, CallerBroker, CallsConn, MemoryBroker, MsgStream, PubSubBroker,
    PubSubConn, RedisBroker, ResultsConn,
};
pub use client::{Client, ClientConfig, ClientEvent, ClientHandler, ExpPayload};
pub use config::Config;
pub use metrics::Metrics;
pub use msg::{CallPayload, EvntPayload, Msg, MsgType, ProtoError, PubPayload, ResPayload};
pub use server::{Authenticator, ConnHandler, Direction, Server};
