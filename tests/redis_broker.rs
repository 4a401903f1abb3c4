//! Redis broker integration tests.
//!
//! Require a running Redis (default `redis://localhost:6379`, override with
//! `JUGGLER_REDIS_URL`). Run with: cargo test --test redis_broker -- --ignored

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout as with_timeout;
use uuid::Uuid;

use juggler::broker::{BrokerError, CalleeBroker, CallerBroker, PubSubBroker, RedisBroker};
use juggler::config::{BrokerConfig, RedisConfig};
use juggler::metrics::Metrics;
use juggler::msg::{CallPayload, PubPayload, ResPayload};

fn redis_config(cluster: bool) -> RedisConfig {
    RedisConfig {
        url: std::env::var("JUGGLER_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        cluster,
    }
}

async fn broker() -> RedisBroker {
    RedisBroker::new(
        &redis_config(false),
        BrokerConfig::default(),
        Arc::new(Metrics::new()),
    )
    .await
    .expect("failed to connect to Redis")
}

/// Unique URI per run so concurrent/leftover state never collides.
fn test_uri(name: &str) -> String {
    format!("{name}.{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn call_round_trips_through_redis() {
    let b = broker().await;
    let uri = test_uri("echo");

    let cp = CallPayload::new(Uuid::new_v4(), Uuid::new_v4(), uri.clone(), b"\"hi\"".to_vec());
    let results = b.results_conn(cp.conn_uuid).await.unwrap();
    let res_stream = results.results();

    let calls = b.calls_conn(&[uri]).await.unwrap();
    let call_stream = calls.calls();

    b.call(cp.clone(), Duration::from_secs(5)).await.unwrap();

    let got = with_timeout(Duration::from_secs(5), call_stream.recv())
        .await
        .expect("no call request within the blocking window")
        .unwrap();
    assert_eq!(got.msg_uuid, cp.msg_uuid);
    assert_eq!(got.args, b"\"hi\"");

    b.result(
        ResPayload::for_call(&got, got.args.clone()),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let rp = with_timeout(Duration::from_secs(5), res_stream.recv())
        .await
        .expect("no result delivered")
        .unwrap();
    assert_eq!(rp.for_uuid, cp.msg_uuid);
    assert_eq!(rp.args, b"\"hi\"");

    calls.close();
    results.close();
}

#[tokio::test]
#[ignore]
async fn expired_call_is_dropped_at_dequeue() {
    let b = broker().await;
    let uri = test_uri("slow");

    let cp = CallPayload::new(Uuid::new_v4(), Uuid::new_v4(), uri.clone(), vec![]);
    b.call(cp, Duration::from_millis(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = b.calls_conn(&[uri]).await.unwrap();
    let got = with_timeout(Duration::from_millis(500), calls.calls().recv()).await;
    assert!(got.is_err(), "expired call must never be delivered");
    calls.close();
}

#[tokio::test]
#[ignore]
async fn result_is_claimed_at_most_once() {
    let metrics = Arc::new(Metrics::new());
    let b = RedisBroker::new(&redis_config(false), BrokerConfig::default(), metrics.clone())
        .await
        .unwrap();
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
    b.result(rp, Duration::from_secs(5)).await.unwrap();

    // both streams get the wakeup; the GETDEL claim succeeds exactly once
    let winner = with_timeout(Duration::from_secs(5), async {
        tokio::select! {
            r = s1.recv() => r,
            r = s2.recv() => r,
        }
    })
    .await
    .unwrap();
    assert!(winner.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(metrics.results_dropped(), 1);

    rc1.close();
    rc2.close();
}

#[tokio::test]
#[ignore]
async fn events_fan_out_with_patterns() {
    let b = broker().await;
    let channel = test_uri("news");
    let pattern = format!("{}*", &channel[..channel.len() - 4]);

    let exact = b.pubsub_conn().await.unwrap();
    exact.subscribe(&channel, false).await.unwrap();
    let exact_stream = exact.events();

    let patterned = b.pubsub_conn().await.unwrap();
    patterned.subscribe(&pattern, true).await.unwrap();
    let pattern_stream = patterned.events();

    // give the backend a beat to register the subscriptions
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pp = PubPayload {
        msg_uuid: Uuid::new_v4(),
        channel: channel.clone(),
        args: b"1".to_vec(),
    };
    b.publish(&channel, pp.clone()).await.unwrap();

    let ev = with_timeout(Duration::from_secs(5), exact_stream.recv())
        .await
        .expect("no exact-match event")
        .unwrap();
    assert_eq!(ev.channel, channel);
    assert_eq!(ev.pattern, "");
    assert_eq!(ev.msg_uuid, pp.msg_uuid);

    let ev = with_timeout(Duration::from_secs(5), pattern_stream.recv())
        .await
        .expect("no pattern-match event")
        .unwrap();
    assert_eq!(ev.channel, channel);
    assert_eq!(ev.pattern, pattern);

    exact.close();
    patterned.close();
}

#[tokio::test]
#[ignore]
async fn cross_shard_uris_fail_fast() {
    let b = RedisBroker::new(
        &redis_config(true),
        BrokerConfig::default(),
        Arc::new(Metrics::new()),
    )
    .await
    .unwrap();

    // "foo" and "bar" live in different cluster slots
    let err = b
        .calls_conn(&["foo".to_string(), "bar".to_string()])
        .await
        .expect_err("cross-shard URI set must be rejected");
    assert!(matches!(err, BrokerError::CrossShard(_)));
}
