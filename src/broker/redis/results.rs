//! Results pump: claim-once delivery of stored call results.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::msg::ResPayload;

use super::super::{BrokerError, PumpStarter};
use super::res_key;

/// Build the pump starter for a caller's results connection.
///
/// The subscription to the wakeup channel is already established by the
/// time this runs; each wakeup names a result key, which the pump claims
/// with an atomic `GETDEL`. A missing key means the result was already
/// claimed or expired, which keeps delivery at-most-once.
pub(super) fn starter<S>(
    conn_uuid: Uuid,
    stream: S,
    manager: ConnectionManager,
    metrics: Arc<Metrics>,
) -> PumpStarter<ResPayload>
where
    S: Stream<Item = redis::Msg> + Send + Unpin + 'static,
{
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
                                "result wakeup subscription lost".into(),
                            )));
                            break;
                        };

                        let wakeup: String = match msg.get_payload() {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(error = %e, "unreadable result wakeup, skipping");
                                continue;
                            }
                        };
                        let Ok(for_uuid) = Uuid::parse_str(&wakeup) else {
                            warn!(payload = %wakeup, "result wakeup is not a UUID, skipping");
                            continue;
                        };

                        let key = res_key(conn_uuid, for_uuid);
                        let mut conn = manager.clone();
                        let claimed: redis::RedisResult<Option<Vec<u8>>> =
                            redis::cmd("GETDEL").arg(&key).query_async(&mut conn).await;
                        match claimed {
                            Ok(Some(bytes)) => match serde_json::from_slice::<ResPayload>(&bytes) {
                                Ok(rp) => queue.push(rp),
                                Err(e) => {
                                    warn!(error = %e, "undecodable stored result, skipping");
                                }
                            },
                            // already claimed or expired
                            Ok(None) => metrics.record_result_dropped(),
                            Err(e) => {
                                queue.close(Some(e.into()));
                                break;
                            }
                        }
                    }
                }
            }
        });
    })
}
