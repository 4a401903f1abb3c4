//! Calls pump: blocking dequeue of per-URI call queues.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::msg::CallPayload;

use super::super::PumpStarter;

/// Build the pump starter for a callee connection.
///
/// The pump owns a dedicated backend connection and cycles a blocking
/// `BRPOP` over the queue keys with a bounded timeout, so shutdown is
/// observed within one cycle even when the queues are idle. Entries past
/// their expiration are dropped without delivery.
pub(super) fn starter(
    keys: Vec<String>,
    conn: MultiplexedConnection,
    blocking_timeout: Duration,
) -> PumpStarter<CallPayload> {
    Box::new(move |queue, mut shutdown| {
        tokio::spawn(async move {
            let secs = blocking_timeout.as_secs_f64();
            let mut conn = conn;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        queue.close(None);
                        break;
                    }
                    popped = conn.brpop::<_, Option<(String, Vec<u8>)>>(&keys, secs) => {
                        match popped {
                            Err(e) => {
                                queue.close(Some(e.into()));
                                break;
                            }
                            // idle cycle, go around
                            Ok(None) => {}
                            Ok(Some((_key, bytes))) => {
                                match serde_json::from_slice::<CallPayload>(&bytes) {
                                    Ok(cp) if cp.expired() => {
                                        debug!(uri = %cp.uri, uuid = %cp.msg_uuid,
                                            "dropping expired call request");
                                    }
                                    Ok(cp) => queue.push(cp),
                                    Err(e) => {
                                        warn!(error = %e, "undecodable call request, skipping");
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
    })
}
