//! Serving subscriptions against the memory broker

mod common;

use common::{
    EXCHANGE, Requester, TestEndpoint, connect, eventually, stats, wait_for_consumers,
};

use amqp_kit::{
    AckAfterEndpoint, CodedError, Error, NackRequeueErrorEncoder, ReplyErrorEncoder, Response,
    StatusCode, SubscribeInfo, Subscriber, set_correlation_id, set_publish_exchange, set_publish_key,
};
use amqp_kit_memory::MemoryBroker;
use bytes::Bytes;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_request_reply() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .serve(vec![
            SubscribeInfo::new("greeter_greet", EXCHANGE, Subscriber::new(TestEndpoint::new("greet")))
                .name("greeter"),
        ])
        .unwrap();
    wait_for_consumers(&broker, "greeter_greet", 1).await;

    let mut requester = Requester::new(&broker).await;
    requester
        .send("greeter.greet", "corr-1", &json!({"name": "ada"}))
        .await;

    let reply = requester.reply().await;
    assert_eq!(reply.body, Bytes::from_static(br#"{"data":{"foo":"bar"}}"#));
    assert_eq!(reply.correlation_id, "corr-1");
    assert_eq!(reply.content_type, "application/json");

    eventually("request ack", || stats(&broker, "greeter_greet").acked == 1).await;

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_error_reply_is_acked() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let endpoint = TestEndpoint::new("fail").failing(CodedError::new(
        "err-message",
        "err_message",
        StatusCode::BAD_REQUEST,
    ));
    client
        .serve(vec![SubscribeInfo::new(
            "accounts_open",
            EXCHANGE,
            Subscriber::new(endpoint),
        )])
        .unwrap();
    wait_for_consumers(&broker, "accounts_open", 1).await;

    let mut requester = Requester::new(&broker).await;
    requester.send("accounts.open", "corr-2", &json!({})).await;

    let reply = requester.reply().await;
    assert_eq!(
        reply.body,
        Bytes::from_static(
            br#"{"error":{"code":"err_message","message":"err-message","status_code":400}}"#
        )
    );
    assert_eq!(reply.correlation_id, "corr-2");

    eventually("failed request ack", || {
        stats(&broker, "accounts_open").acked == 1
    })
    .await;
    assert_eq!(stats(&broker, "accounts_open").rejected, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_reply_only_encoder_still_settles() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let subscriber = Subscriber::new(
        TestEndpoint::new("refund").failing(CodedError::internal("ledger offline")),
    )
    .error_encoder(ReplyErrorEncoder);
    client
        .serve(vec![SubscribeInfo::new("payments_refund", EXCHANGE, subscriber)])
        .unwrap();
    wait_for_consumers(&broker, "payments_refund", 1).await;

    let mut requester = Requester::new(&broker).await;
    requester.send("payments.refund", "r-1", &json!({})).await;
    let reply = requester.reply().await;
    assert_eq!(reply.correlation_id, "r-1");

    eventually("failed request settled", || {
        stats(&broker, "payments_refund").settled() == 1
    })
    .await;

    // The worker keeps serving after the failure
    requester.send("payments.refund", "r-2", &json!({})).await;
    assert_eq!(requester.reply().await.correlation_id, "r-2");
    eventually("second request settled", || {
        stats(&broker, "payments_refund").settled() == 2
    })
    .await;

    let stats = stats(&broker, "payments_refund");
    assert_eq!(stats.acked, 2);
    assert_eq!(stats.requeued, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_request_is_internal_error() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    client
        .serve(vec![SubscribeInfo::new(
            "accounts_close",
            EXCHANGE,
            Subscriber::new(TestEndpoint::new("close")),
        )])
        .unwrap();
    wait_for_consumers(&broker, "accounts_close", 1).await;

    let mut requester = Requester::new(&broker).await;
    requester
        .send_raw(EXCHANGE, "accounts.close", "corr-3", Bytes::from_static(b"not json"))
        .await;

    let reply = requester.reply().await;
    let response: Response<Value> = serde_json::from_slice(&reply.body).unwrap();
    let err = response.error.expect("error reply");

    assert!(response.data.is_none());
    assert_eq!(err.code, "");
    assert_eq!(err.status_code, 500);
    assert!(!err.message.is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_queue_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    let err = client
        .serve(vec![
            SubscribeInfo::new("jobs", EXCHANGE, Subscriber::new(TestEndpoint::new("a"))),
            SubscribeInfo::new("jobs", EXCHANGE, Subscriber::new(TestEndpoint::new("b"))),
        ])
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateQueue(ref queue) if queue == "jobs"));
    assert_eq!(err.to_string(), "duplicate queue entry: 'jobs'");

    // Nothing from the rejected batch was registered or started
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.queue_stats("jobs").is_none());

    client
        .serve(vec![SubscribeInfo::new(
            "jobs",
            EXCHANGE,
            Subscriber::new(TestEndpoint::new("a")),
        )])
        .unwrap();

    let err = client
        .serve(vec![SubscribeInfo::new(
            "jobs",
            EXCHANGE,
            Subscriber::new(TestEndpoint::new("c")),
        )])
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateQueue(_)));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_shared_queue_routes_first_match() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .serve(vec![
            SubscribeInfo::new(
                "orders",
                EXCHANGE,
                Subscriber::new(TestEndpoint::new("created").reporting(tx.clone())),
            )
            .key("orders.created")
            .route(
                "orders.*",
                Subscriber::new(TestEndpoint::new("any").reporting(tx)),
            ),
        ])
        .unwrap();
    wait_for_consumers(&broker, "orders", 1).await;

    let mut requester = Requester::new(&broker).await;

    requester.send("orders.created", "1", &json!({})).await;
    requester.reply().await;
    let seen = rx.recv().await.unwrap();
    assert_eq!(seen.endpoint, "created");
    assert_eq!(seen.routing_key, "orders.created");

    requester.send("orders.shipped", "2", &json!({})).await;
    requester.reply().await;
    let seen = rx.recv().await.unwrap();
    assert_eq!(seen.endpoint, "any");
    assert_eq!(seen.routing_key, "orders.shipped");

    // Straight to the queue under a key no route matches
    requester
        .send_raw("", "orders", "3", Bytes::from_static(b"{}"))
        .await;

    eventually("unrouted delivery rejected", || {
        stats(&broker, "orders").rejected == 1
    })
    .await;
    assert!(rx.try_recv().is_err());
    assert!(requester.no_reply_within(Duration::from_millis(100)).await);

    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_serve_in_parallel() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let endpoint = TestEndpoint::new("slow").with_delay(Duration::from_millis(500));
    client
        .serve(vec![
            SubscribeInfo::new("reports_build", EXCHANGE, Subscriber::new(endpoint)).workers(2),
        ])
        .unwrap();
    wait_for_consumers(&broker, "reports_build", 2).await;

    let mut requester = Requester::new(&broker).await;
    let started = Instant::now();
    requester.send("reports.build", "1", &json!({})).await;
    requester.send("reports.build", "2", &json!({})).await;

    requester.reply().await;
    requester.reply().await;

    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(900),
        "two workers took {elapsed:?}"
    );

    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_delivery_settled_once() {
    let _ = tracing_subscriber::fmt::try_init();

    const REQUESTS: u64 = 50;

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    // The endpoint acks early, the subscriber must not ack again
    let subscriber = Subscriber::new(TestEndpoint::new("tally")).after(AckAfterEndpoint::default());
    client
        .serve(vec![
            SubscribeInfo::new("tally_add", EXCHANGE, subscriber)
                .name("tally")
                .workers(4),
        ])
        .unwrap();
    wait_for_consumers(&broker, "tally_add", 4).await;

    let mut requester = Requester::new(&broker).await;
    for i in 0..REQUESTS {
        requester
            .send("tally.add", &i.to_string(), &json!({"n": i}))
            .await;
    }

    let mut correlation_ids = std::collections::HashSet::new();
    for _ in 0..REQUESTS {
        correlation_ids.insert(requester.reply().await.correlation_id);
    }
    assert_eq!(correlation_ids.len(), 50);

    eventually("all deliveries settled", || {
        stats(&broker, "tally_add").settled() == REQUESTS
    })
    .await;

    let stats = stats(&broker, "tally_add");
    assert_eq!(stats.acked, REQUESTS);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.requeued, 0);
    assert_eq!(stats.ready, 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_reply_target_middleware() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let subscriber = Subscriber::new(TestEndpoint::new("audit"))
        .before(set_publish_exchange(EXCHANGE))
        .before(set_publish_key("replies.audit"))
        .before(set_correlation_id("fixed"));
    client
        .serve(vec![SubscribeInfo::new("audit_log", EXCHANGE, subscriber)])
        .unwrap();
    wait_for_consumers(&broker, "audit_log", 1).await;

    let mut audit = Requester::listening(&broker, "audit_replies", Some("replies.#")).await;
    let mut requester = Requester::new(&broker).await;
    requester.send("audit.log", "original", &json!({})).await;

    let reply = audit.reply().await;
    assert_eq!(reply.exchange, EXCHANGE);
    assert_eq!(reply.routing_key, "replies.audit");
    assert_eq!(reply.correlation_id, "fixed");

    assert!(requester.no_reply_within(Duration::from_millis(100)).await);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_requeue_encoder() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;
    let subscriber = Subscriber::new(
        TestEndpoint::new("flaky").failing(CodedError::internal("backend down")),
    )
    .error_encoder(NackRequeueErrorEncoder::new(Duration::from_millis(20)));
    client
        .serve(vec![SubscribeInfo::new("sync_push", EXCHANGE, subscriber)])
        .unwrap();
    wait_for_consumers(&broker, "sync_push", 1).await;

    let mut requester = Requester::new(&broker).await;
    requester.send("sync.push", "1", &json!({})).await;

    eventually("repeated requeue", || stats(&broker, "sync_push").requeued >= 2).await;
    assert!(requester.no_reply_within(Duration::from_millis(100)).await);

    client.close().await.unwrap();

    let stats = stats(&broker, "sync_push");
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.ready, 1);
}

#[tokio::test]
async fn test_ping_and_close() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MemoryBroker::new();
    let client = connect(&broker).await;

    assert!(client.is_connected());
    client.ping().await.unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert!(!client.is_connected());
    assert!(client.ping().await.is_err());
    assert_eq!(broker.connection_count(), 0);

    let err = client
        .serve(vec![SubscribeInfo::new(
            "late",
            EXCHANGE,
            Subscriber::new(TestEndpoint::new("late")),
        )])
        .unwrap_err();
    assert!(matches!(err, Error::Closed));
}
