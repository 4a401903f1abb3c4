//! Redis broker adapter.
//!
//! Realizes the broker contract on Redis primitives. Key structure:
//! - `calls:<uri>` - list of pending call requests for a URI
//! - `__calls:<uri>` - wakeup channel for idle queue waiters
//! - `calls:<uri>:poke` - short-lived marker that work was queued
//! - `res:<connUUID>:<forUUID>` - stored result, claimed once, TTL-bound
//! - `__res:<connUUID>` - result wakeup channel for a caller connection
//!
//! Request/reply commands go through a shared [`ConnectionManager`]; every
//! pump holds its own dedicated connection so a blocking dequeue or a
//! subscription never stalls unrelated traffic. Pump errors are terminal for
//! their stream; reopening is the caller's job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{BrokerConfig, RedisConfig};
use crate::metrics::Metrics;
use crate::msg::{CallPayload, ProtoError, PubPayload, ResPayload};

use super::{
    BrokerError, CalleeBroker, CallerBroker, CallsConn, DeliveryQueue, PubSubBroker, PubSubConn,
    Result, ResultsConn, StreamConn,
};

mod calls;
mod cluster;
mod pubsub;
mod results;

pub(crate) fn calls_key(uri: &str) -> String {
    format!("calls:{uri}")
}

pub(crate) fn calls_channel(uri: &str) -> String {
    format!("__calls:{uri}")
}

pub(crate) fn calls_poke_key(uri: &str) -> String {
    format!("calls:{uri}:poke")
}

pub(crate) fn res_key(conn_uuid: Uuid, for_uuid: Uuid) -> String {
    format!("res:{conn_uuid}:{for_uuid}")
}

pub(crate) fn res_channel(conn_uuid: Uuid) -> String {
    format!("__res:{conn_uuid}")
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| BrokerError::Proto(ProtoError::Encode(e.to_string())))
}

/// Broker over a Redis (or Redis cluster) backend.
pub struct RedisBroker {
    client: redis::Client,
    manager: ConnectionManager,
    config: BrokerConfig,
    cluster_mode: bool,
    metrics: Arc<Metrics>,
}

impl RedisBroker {
    /// Connect to the backend and build the broker.
    pub async fn new(
        redis_config: &RedisConfig,
        config: BrokerConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_config.url.as_str())?;
        let manager = ConnectionManager::new(client.clone()).await?;

        info!(url = %redis_config.url, cluster = redis_config.cluster, "Connected to Redis");

        Ok(Self {
            client,
            manager,
            config,
            cluster_mode: redis_config.cluster,
            metrics,
        })
    }
}

#[async_trait]
impl CallerBroker for RedisBroker {
    async fn call(&self, mut cp: CallPayload, timeout: Duration) -> Result<()> {
        let timeout = self.config.effective_call_timeout(timeout);
        super::stamp_expiration(&mut cp, timeout);
        let data = encode_payload(&cp)?;

        let mut conn = self.manager.clone();
        let _: () = conn.lpush(calls_key(&cp.uri), data).await?;
        // poke + wakeup so an idle waiter learns of the work without polling
        let _: () = conn
            .pset_ex(calls_poke_key(&cp.uri), 1u8, self.config.blocking_timeout_ms)
            .await?;
        let _: () = conn.publish(calls_channel(&cp.uri), 1u8).await?;

        debug!(uri = %cp.uri, uuid = %cp.msg_uuid, "queued call request");
        Ok(())
    }

    async fn results_conn(&self, conn_uuid: Uuid) -> Result<ResultsConn> {
        let mut backend = self.client.get_async_pubsub().await?;
        backend.subscribe(res_channel(conn_uuid)).await?;
        let stream = Box::pin(backend.into_on_message());

        let hook_metrics = self.metrics.clone();
        let queue = DeliveryQueue::with_drop_hook(
            self.config.stream_queue_capacity,
            Box::new(move || hook_metrics.record_result_dropped()),
        );

        let starter =
            results::starter(conn_uuid, stream, self.manager.clone(), self.metrics.clone());
        Ok(ResultsConn(StreamConn::new(queue, starter)))
    }
}

#[async_trait]
impl CalleeBroker for RedisBroker {
    async fn calls_conn(&self, uris: &[String]) -> Result<CallsConn> {
        if uris.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "at least one URI is required".into(),
            ));
        }

        let keys: Vec<String> = uris.iter().map(|u| calls_key(u)).collect();
        if self.cluster_mode {
            // fail before any backend work is done
            cluster::ensure_single_slot(&keys)?;
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        let queue = DeliveryQueue::new(self.config.stream_queue_capacity);
        let starter = calls::starter(keys, conn, self.config.blocking_timeout());
        Ok(CallsConn(StreamConn::new(queue, starter)))
    }

    async fn result(&self, rp: ResPayload, timeout: Duration) -> Result<()> {
        let ttl = self.config.effective_call_timeout(timeout);
        let data = encode_payload(&rp)?;
        let key = res_key(rp.conn_uuid, rp.for_uuid);

        let mut conn = self.manager.clone();
        let _: () = conn.pset_ex(&key, data, ttl.as_millis() as u64).await?;
        let _: () = conn
            .publish(res_channel(rp.conn_uuid), rp.for_uuid.to_string())
            .await?;

        debug!(conn_uuid = %rp.conn_uuid, for_uuid = %rp.for_uuid, "stored call result");
        Ok(())
    }
}

#[async_trait]
impl PubSubBroker for RedisBroker {
    async fn pubsub_conn(&self) -> Result<PubSubConn> {
        let backend = self.client.get_async_pubsub().await?;
        let (sink, stream) = backend.split();

        let hook_metrics = self.metrics.clone();
        let queue = DeliveryQueue::with_drop_hook(
            self.config.stream_queue_capacity,
            Box::new(move || hook_metrics.record_event_dropped()),
        );

        Ok(PubSubConn::new(
            StreamConn::new(queue, pubsub::starter(stream)),
            Box::new(pubsub::RedisSubOps::new(sink)),
            Arc::new(tokio::sync::Mutex::new(HashSet::new())),
            Arc::new(tokio::sync::Mutex::new(HashSet::new())),
        ))
    }

    async fn publish(&self, channel: &str, pp: PubPayload) -> Result<()> {
        let data = encode_payload(&pp)?;
        let mut conn = self.manager.clone();
        let _: () = conn.publish(channel, data).await?;
        self.metrics.record_event_published();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let conn = Uuid::nil();
        let call = Uuid::nil();
        assert_eq!(calls_key("a.b"), "calls:a.b");
        assert_eq!(calls_channel("a.b"), "__calls:a.b");
        assert_eq!(calls_poke_key("a.b"), "calls:a.b:poke");
        assert_eq!(res_key(conn, call), format!("res:{conn}:{call}"));
        assert_eq!(res_channel(conn), format!("__res:{conn}"));
    }
}
