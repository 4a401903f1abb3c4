//! In-memory broker for single-process deployments and tests.
//!
//! Implements the same semantics as the Redis adapter — per-URI call queues
//! with expiry, claim-once result storage with TTL, pattern-matched event
//! fan-out — on tokio primitives, with no external backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::metrics::Metrics;
use crate::msg::{CallPayload, EvntPayload, PubPayload, ResPayload};

use super::{
    glob_match, BrokerError, CalleeBroker, CallerBroker, CallsConn, DeliveryQueue, PubSubBroker,
    PubSubConn, PumpStarter, Result, ResultsConn, StreamConn, SubscriptionOps,
};

/// Capacity of the internal wakeup/fan-out channels.
const CHANNEL_CAPACITY: usize = 256;

/// Single-process broker over tokio channels.
pub struct MemoryBroker {
    config: BrokerConfig,
    metrics: Arc<Metrics>,
    state: Arc<MemoryState>,
}

struct MemoryState {
    /// Per-URI call queues, drained competitively by calls pumps.
    queues: std::sync::Mutex<HashMap<String, VecDeque<CallPayload>>>,
    /// Wakes calls pumps blocked on idle queues.
    calls_added: Notify,
    /// Stored results keyed by (caller connection, call UUID); claimed once.
    results: std::sync::Mutex<HashMap<(Uuid, Uuid), StoredResult>>,
    /// Result wakeups, carrying the storage key.
    res_tx: broadcast::Sender<(Uuid, Uuid)>,
    /// Published events, filtered per subscriber connection.
    pub_tx: broadcast::Sender<PubEvent>,
}

struct StoredResult {
    rp: ResPayload,
    expires_at: Instant,
}

#[derive(Clone)]
struct PubEvent {
    channel: String,
    pp: PubPayload,
}

impl MemoryBroker {
    pub fn new(config: BrokerConfig, metrics: Arc<Metrics>) -> Self {
        let (res_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (pub_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            config,
            metrics,
            state: Arc::new(MemoryState {
                queues: std::sync::Mutex::new(HashMap::new()),
                calls_added: Notify::new(),
                results: std::sync::Mutex::new(HashMap::new()),
                res_tx,
                pub_tx,
            }),
        }
    }
}

#[async_trait]
impl CallerBroker for MemoryBroker {
    async fn call(&self, mut cp: CallPayload, timeout: Duration) -> Result<()> {
        let timeout = self.config.effective_call_timeout(timeout);
        super::stamp_expiration(&mut cp, timeout);

        {
            let mut queues = self.state.queues.lock().unwrap();
            queues.entry(cp.uri.clone()).or_default().push_back(cp);
        }
        self.state.calls_added.notify_waiters();
        Ok(())
    }

    async fn results_conn(&self, conn_uuid: Uuid) -> Result<ResultsConn> {
        // Subscribe before the pump starts so wakeups sent in between are
        // buffered rather than lost.
        let mut rx = self.state.res_tx.subscribe();
        let state = self.state.clone();
        let metrics = self.metrics.clone();
        let hook_metrics = self.metrics.clone();

        let queue = DeliveryQueue::with_drop_hook(
            self.config.stream_queue_capacity,
            Box::new(move || hook_metrics.record_result_dropped()),
        );

        let starter: PumpStarter<ResPayload> = Box::new(move |queue, mut shutdown| {
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            queue.close(None);
                            break;
                        }
                        wakeup = rx.recv() => match wakeup {
                            Ok((conn, for_uuid)) if conn == conn_uuid => {
                                let claimed =
                                    state.results.lock().unwrap().remove(&(conn, for_uuid));
                                match claimed {
                                    Some(stored) if stored.expires_at > Instant::now() => {
                                        queue.push(stored.rp);
                                    }
                                    // expired, or already claimed by a
                                    // competing stream for the same UUID
                                    _ => metrics.record_result_dropped(),
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "result wakeups lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                queue.close(Some(BrokerError::Unavailable(
                                    "broker dropped".into(),
                                )));
                                break;
                            }
                        }
                    }
                }
            });
        });

        Ok(ResultsConn(StreamConn::new(queue, starter)))
    }
}

#[async_trait]
impl CalleeBroker for MemoryBroker {
    async fn calls_conn(&self, uris: &[String]) -> Result<CallsConn> {
        if uris.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "at least one URI is required".into(),
            ));
        }

        let uris: Vec<String> = uris.to_vec();
        let state = self.state.clone();
        let blocking = self.config.blocking_timeout();
        let queue = DeliveryQueue::new(self.config.stream_queue_capacity);

        let starter: PumpStarter<CallPayload> = Box::new(move |queue, mut shutdown| {
            tokio::spawn(async move {
                loop {
                    // Register interest before draining so a push racing the
                    // drain still wakes us.
                    let notified = state.calls_added.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    let mut drained = Vec::new();
                    {
                        let mut queues = state.queues.lock().unwrap();
                        for uri in &uris {
                            if let Some(q) = queues.get_mut(uri) {
                                drained.extend(q.drain(..));
                            }
                        }
                    }
                    for cp in drained {
                        if cp.expired() {
                            debug!(uri = %cp.uri, uuid = %cp.msg_uuid, "dropping expired call request");
                            continue;
                        }
                        queue.push(cp);
                    }

                    tokio::select! {
                        _ = shutdown.changed() => {
                            queue.close(None);
                            break;
                        }
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(blocking) => {}
                    }
                }
            });
        });

        Ok(CallsConn(StreamConn::new(queue, starter)))
    }

    async fn result(&self, rp: ResPayload, timeout: Duration) -> Result<()> {
        let ttl = self.config.effective_call_timeout(timeout);
        let key = (rp.conn_uuid, rp.for_uuid);

        {
            let mut results = self.state.results.lock().unwrap();
            let now = Instant::now();
            results.retain(|_, stored| stored.expires_at > now);
            results.insert(
                key,
                StoredResult {
                    rp,
                    expires_at: now + ttl,
                },
            );
        }

        let _ = self.state.res_tx.send(key);
        Ok(())
    }
}

#[async_trait]
impl PubSubBroker for MemoryBroker {
    async fn pubsub_conn(&self) -> Result<PubSubConn> {
        let mut rx = self.state.pub_tx.subscribe();

        let exact: Arc<AsyncMutex<HashSet<String>>> = Arc::new(AsyncMutex::new(HashSet::new()));
        let patterns: Arc<AsyncMutex<HashSet<String>>> = Arc::new(AsyncMutex::new(HashSet::new()));
        let pump_exact = exact.clone();
        let pump_patterns = patterns.clone();

        let hook_metrics = self.metrics.clone();
        let queue = DeliveryQueue::with_drop_hook(
            self.config.stream_queue_capacity,
            Box::new(move || hook_metrics.record_event_dropped()),
        );

        let starter: PumpStarter<EvntPayload> = Box::new(move |queue, mut shutdown| {
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            queue.close(None);
                            break;
                        }
                        event = rx.recv() => match event {
                            Ok(ev) => {
                                if pump_exact.lock().await.contains(&ev.channel) {
                                    queue.push(EvntPayload::from_pub(&ev.pp, ev.channel.as_str(), ""));
                                }
                                let matching: Vec<String> = pump_patterns
                                    .lock()
                                    .await
                                    .iter()
                                    .filter(|p| glob_match(p, &ev.channel))
                                    .cloned()
                                    .collect();
                                for pattern in matching {
                                    queue.push(EvntPayload::from_pub(
                                        &ev.pp,
                                        ev.channel.as_str(),
                                        pattern,
                                    ));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "event stream lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                queue.close(Some(BrokerError::Unavailable(
                                    "broker dropped".into(),
                                )));
                                break;
                            }
                        }
                    }
                }
            });
        });

        Ok(PubSubConn::new(
            StreamConn::new(queue, starter),
            Box::new(MemorySubOps),
            exact,
            patterns,
        ))
    }

    async fn publish(&self, channel: &str, pp: PubPayload) -> Result<()> {
        let _ = self.state.pub_tx.send(PubEvent {
            channel: channel.to_string(),
            pp,
        });
        self.metrics.record_event_published();
        Ok(())
    }
}

/// Subscription state lives entirely in the connection; there is no backend
/// to tell.
struct MemorySubOps;

#[async_trait]
impl SubscriptionOps for MemorySubOps {
    async fn subscribe(&self, _channel: &str, _pattern: bool) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _channel: &str, _pattern: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout as with_timeout;

    fn broker() -> MemoryBroker {
        MemoryBroker::new(BrokerConfig::default(), Arc::new(Metrics::new()))
    }

    fn call_payload(uri: &str) -> CallPayload {
        CallPayload::new(Uuid::new_v4(), Uuid::new_v4(), uri, b"\"hi\"".to_vec())
    }

    #[tokio::test]
    async fn call_flows_to_callee_and_result_back() {
        let b = broker();
        let cp = call_payload("echo");
        let caller_conn = cp.conn_uuid;

        let results = b.results_conn(caller_conn).await.unwrap();
        let res_stream = results.results();

        b.call(cp.clone(), Duration::from_secs(1)).await.unwrap();

        let calls = b.calls_conn(&["echo".to_string()]).await.unwrap();
        let got = with_timeout(Duration::from_secs(1), calls.calls().recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.msg_uuid, cp.msg_uuid);

        b.result(
            ResPayload::for_call(&got, got.args.clone()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let rp = with_timeout(Duration::from_secs(1), res_stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rp.for_uuid, cp.msg_uuid);
        assert_eq!(rp.args, b"\"hi\"");
    }

    #[tokio::test]
    async fn expired_call_is_never_delivered() {
        let b = broker();
        b.call(call_payload("slow"), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let calls = b.calls_conn(&["slow".to_string()]).await.unwrap();
        let got = with_timeout(Duration::from_millis(100), calls.calls().recv()).await;
        assert!(got.is_err(), "expired call must be silently dropped");
        // the queue slot is freed
        assert!(b
            .state
            .queues
            .lock()
            .unwrap()
            .get("slow")
            .map(|q| q.is_empty())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn result_is_claimed_at_most_once() {
        let metrics = Arc::new(Metrics::new());
        let b = MemoryBroker::new(BrokerConfig::default(), metrics.clone());
        let conn_uuid = Uuid::new_v4();

        let rc1 = b.results_conn(conn_uuid).await.unwrap();
        let rc2 = b.results_conn(conn_uuid).await.unwrap();
        let s1 = rc1.results();
        let s2 = rc2.results();

        let rp = ResPayload {
            msg_uuid: Uuid::new_v4(),
            conn_uuid,
            for_uuid: Uuid::new_v4(),
            args: b"1".to_vec(),
        };
        b.result(rp, Duration::from_secs(1)).await.unwrap();

        // both pumps race the claim; exactly one wins
        let first = with_timeout(Duration::from_secs(1), async {
            tokio::select! {
                r = s1.recv() => r,
                r = s2.recv() => r,
            }
        })
        .await
        .unwrap();
        assert!(first.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.results_dropped(), 1);
    }

    #[tokio::test]
    async fn result_past_ttl_is_dropped() {
        let metrics = Arc::new(Metrics::new());
        let b = MemoryBroker::new(BrokerConfig::default(), metrics.clone());
        let conn_uuid = Uuid::new_v4();

        let rc = b.results_conn(conn_uuid).await.unwrap();

        let rp = ResPayload {
            msg_uuid: Uuid::new_v4(),
            conn_uuid,
            for_uuid: Uuid::new_v4(),
            args: vec![],
        };
        b.result(rp, Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // pump starts only now; the wakeup is buffered but the claim misses
        let got = with_timeout(Duration::from_millis(100), rc.results().recv()).await;
        assert!(got.is_err());
        assert_eq!(metrics.results_dropped(), 1);
    }

    #[tokio::test]
    async fn events_fan_out_with_patterns() {
        let b = broker();

        let exact = b.pubsub_conn().await.unwrap();
        exact.subscribe("news", false).await.unwrap();
        let exact_stream = exact.events();

        let patterned = b.pubsub_conn().await.unwrap();
        patterned.subscribe("new*", true).await.unwrap();
        let pattern_stream = patterned.events();

        let pp = PubPayload {
            msg_uuid: Uuid::new_v4(),
            channel: "news".into(),
            args: b"1".to_vec(),
        };
        b.publish("news", pp.clone()).await.unwrap();

        let ev = with_timeout(Duration::from_secs(1), exact_stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.channel, "news");
        assert_eq!(ev.pattern, "");
        assert_eq!(ev.msg_uuid, pp.msg_uuid);

        let ev = with_timeout(Duration::from_secs(1), pattern_stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.channel, "news");
        assert_eq!(ev.pattern, "new*");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let b = broker();
        let conn = b.pubsub_conn().await.unwrap();
        conn.subscribe("news", false).await.unwrap();
        let stream = conn.events();

        let pp = PubPayload {
            msg_uuid: Uuid::new_v4(),
            channel: "news".into(),
            args: vec![],
        };
        b.publish("news", pp.clone()).await.unwrap();
        assert!(with_timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .is_some());

        conn.unsubscribe("news", false).await.unwrap();
        b.publish("news", pp).await.unwrap();
        assert!(
            with_timeout(Duration::from_millis(100), stream.recv())
                .await
                .is_err(),
            "no delivery after unsubscribe"
        );
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_idempotence() {
        let b = broker();
        let conn = b.pubsub_conn().await.unwrap();

        conn.subscribe("a", false).await.unwrap();
        conn.subscribe("a", false).await.unwrap();
        conn.unsubscribe("a", false).await.unwrap();
        conn.unsubscribe("a", false).await.unwrap();
        conn.unsubscribe("never-subscribed", true).await.unwrap();

        assert!(conn.exact.lock().await.is_empty());
        assert!(conn.patterns.lock().await.is_empty());
    }

    #[tokio::test]
    async fn close_interrupts_stream() {
        let b = broker();
        let calls = b.calls_conn(&["echo".to_string()]).await.unwrap();
        let stream = calls.calls();
        calls.close();
        let got = with_timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(calls.err().is_none(), "clean close records no error");
    }

    #[tokio::test]
    async fn calls_conn_requires_uris() {
        let b = broker();
        assert!(matches!(
            b.calls_conn(&[]).await.err(),
            Some(BrokerError::InvalidArgument(_))
        ));
    }
}
