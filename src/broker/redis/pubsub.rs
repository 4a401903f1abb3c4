//! Pub/sub bridge: native subscriptions and the event pump.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{PubSubSink, PubSubStream};
use tokio::sync::Mutex;
use tracing::warn;

use crate::msg::{EvntPayload, PubPayload};

use super::super::{BrokerError, PumpStarter, Result, SubscriptionOps};

/// Subscribe/unsubscribe against the backend connection's sink half.
pub(super) struct RedisSubOps {
    sink: Mutex<PubSubSink>,
}

impl RedisSubOps {
    pub(super) fn new(sink: PubSubSink) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl SubscriptionOps for RedisSubOps {
    async fn subscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if pattern {
            sink.psubscribe(channel).await?;
        } else {
            sink.subscribe(channel).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, pattern: bool) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if pattern {
            sink.punsubscribe(channel).await?;
        } else {
            sink.unsubscribe(channel).await?;
        }
        Ok(())
    }
}

/// Build the event pump starter for a pub/sub connection.
///
/// The backend fans a message out once per matching subscription, stamping
/// the pattern on pattern-matched deliveries; the pump just decodes and
/// forwards.
pub(super) fn starter(stream: PubSubStream) -> PumpStarter<EvntPayload> {
    Box::new(move |queue, mut shutdown| {
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        queue.close(None);
                        break;
                    }
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            queue.close(Some(BrokerError::Unavailable(
                                "pub/sub subscription lost".into(),
                            )));
                            break;
                        };

                        let channel = msg.get_channel_name().to_string();
                        // empty for exact-channel deliveries
                        let pattern: String = msg.get_pattern().unwrap_or_default();
                        match serde_json::from_slice::<PubPayload>(msg.get_payload_bytes()) {
                            Ok(pp) => {
                                queue.push(EvntPayload::from_pub(&pp, channel, pattern));
                            }
                            Err(e) => {
                                warn!(channel = %channel, error = %e,
                                    "undecodable event payload, skipping");
                            }
                        }
                    }
                }
            }
        });
    })
}
