// tests/rpc_roundtrip.rs
// End-to-end calls through the in-process broker

use futures::future::join_all;
use rabbit_rpc::rabbitmq::message::QueueOptions;
use rabbit_rpc::rabbitmq::{BrokerConnection, Delivery, JsonHandler, RabbitMQClientBuilder};
use rabbit_rpc::{HandlerRegistry, InMemoryBroker, RabbitMQClient, RabbitMQError, RpcProvider};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn start(broker: &InMemoryBroker, builder: RabbitMQClientBuilder) -> RabbitMQClient {
    let connection: Arc<dyn BrokerConnection> = Arc::new(broker.connect());
    builder.start(connection).await.unwrap()
}

fn echo_builder() -> RabbitMQClientBuilder {
    RabbitMQClient::builder().register_default("echo", |d: Delivery| async move {
        Ok::<_, RabbitMQError>(Some(d.body))
    })
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within a second");
}

struct PingProvider;

impl RpcProvider for PingProvider {
    fn name(&self) -> &str {
        "ping"
    }

    fn declare(&self, registry: &mut HandlerRegistry) -> rabbit_rpc::Result<()> {
        registry.register_topic("rpc", "rpc.ping", "ping_queue", |d: Delivery| async move {
            Ok::<_, RabbitMQError>(Some(format!("{}-ack", d.body_str()).into_bytes()))
        });
        Ok(())
    }
}

struct SilentProvider;

impl RpcProvider for SilentProvider {
    fn declare(&self, _registry: &mut HandlerRegistry) -> rabbit_rpc::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn ping_provider_answers_over_topic_exchange() {
    let broker = InMemoryBroker::new();
    let builder = RabbitMQClient::builder()
        .register_provider(&PingProvider)
        .unwrap();
    let client = start(&broker, builder).await;

    let reply = client.invoke("rpc", "rpc.ping", "hello").await.unwrap();
    assert_eq!(reply, b"hello-ack");
    assert_eq!(client.registry().providers(), ["ping".to_string()]);
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(broker.queue_names(), vec!["ping_queue".to_string()]);

    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_get_their_own_replies() {
    let broker = InMemoryBroker::new();
    let client = Arc::new(start(&broker, echo_builder()).await);

    let calls = (0..50).map(|i| {
        let client = client.clone();
        tokio::spawn(async move {
            let body = format!("request-{}", i);
            let reply = client.invoke("", "echo", body.as_bytes()).await.unwrap();
            (body, String::from_utf8(reply).unwrap())
        })
    });
    for joined in join_all(calls).await {
        let (sent, received) = joined.unwrap();
        assert_eq!(sent, received);
    }

    assert_eq!(client.pending_calls(), 0);
    eventually(|| broker.queue_names() == vec!["echo".to_string()]).await;
}

#[tokio::test]
async fn unanswered_call_times_out_and_cleans_up() {
    let broker = InMemoryBroker::new();
    let builder = RabbitMQClient::builder().register_default("sink", |_d: Delivery| async {
        Ok::<_, RabbitMQError>(None)
    });
    let client = start(&broker, builder).await;

    let deadline = Duration::from_millis(200);
    let started = Instant::now();
    let err = client
        .invoke_with_timeout("", "sink", "anyone?", Some(deadline))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        RabbitMQError::CallTimeout(after) => assert_eq!(after, deadline),
        other => panic!("unexpected error: {other}"),
    }
    assert!(elapsed >= deadline);
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(broker.queue_names(), vec!["sink".to_string()]);
}

#[tokio::test]
async fn late_reply_is_dropped_without_disturbing_later_calls() {
    let broker = InMemoryBroker::new();
    let builder = echo_builder().register_default("slow", |d: Delivery| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok::<_, RabbitMQError>(Some(d.body))
    });
    let client = start(&broker, builder).await;

    let err = client
        .invoke_with_timeout("", "slow", "late", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::CallTimeout(_)));

    // the slow handler replies to a queue that no longer exists
    eventually(|| broker.unacked_count() == 0).await;

    let reply = client.invoke("", "echo", "after").await.unwrap();
    assert_eq!(reply, b"after");
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(
        broker.queue_names(),
        vec!["echo".to_string(), "slow".to_string()]
    );
}

#[tokio::test]
async fn wildcard_bindings_route_matching_keys_only() {
    let broker = InMemoryBroker::new();
    let builder = RabbitMQClient::builder().register_topic(
        "orders",
        "orders.*",
        "orders_queue",
        |d: Delivery| async move { Ok::<_, RabbitMQError>(Some(d.routing_key.into_bytes())) },
    );
    let client = start(&broker, builder).await;

    let reply = client.invoke("orders", "orders.created", "{}").await.unwrap();
    assert_eq!(reply, b"orders.created");

    let quick = Some(Duration::from_millis(100));
    let err = client
        .invoke_with_timeout("orders", "billing.created", "{}", quick)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::CallTimeout(_)));

    let err = client
        .invoke_with_timeout("orders", "orders.created.eu", "{}", quick)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::CallTimeout(_)));
}

#[tokio::test]
async fn publishing_to_a_missing_exchange_fails_cleanly() {
    let broker = InMemoryBroker::new();
    let client = start(&broker, echo_builder()).await;

    let err = client.invoke("nowhere", "some.key", "hi").await.unwrap_err();
    assert!(matches!(err, RabbitMQError::PublishFailure(_)), "{err}");
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(broker.queue_names(), vec!["echo".to_string()]);

    let err = client.publish("nowhere", "some.key", "hi").await.unwrap_err();
    assert!(matches!(err, RabbitMQError::PublishFailure(_)));

    // the broker closed the caller channel over each failure; later calls reopen it
    assert_eq!(client.invoke("", "echo", "again").await.unwrap(), b"again");
    client.publish("", "echo", "fire").await.unwrap();
    eventually(|| broker.unacked_count() == 0).await;
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(broker.queue_names(), vec!["echo".to_string()]);
}

#[tokio::test]
async fn abandoned_calls_release_their_reply_queues() {
    let broker = InMemoryBroker::new();
    let builder = RabbitMQClient::builder().register_default("sink", |_d: Delivery| async {
        Ok::<_, RabbitMQError>(None)
    });
    let client = start(&broker, builder).await;

    for _ in 0..3 {
        let call = client.invoke("", "sink", "x");
        let abandoned = tokio::time::timeout(Duration::from_millis(50), call).await;
        assert!(abandoned.is_err());
    }

    assert_eq!(client.pending_calls(), 0);
    eventually(|| broker.queue_names() == vec!["sink".to_string()]).await;
    eventually(|| broker.unacked_count() == 0).await;
    assert!(client.is_running());
}

#[tokio::test]
async fn failing_handlers_do_not_block_other_queues() {
    let broker = InMemoryBroker::new();
    let builder = echo_builder()
        .register_default("broken", |_d: Delivery| async {
            Err::<Option<Vec<u8>>, _>(RabbitMQError::handler("boom"))
        })
        .register_default("explosive", |d: Delivery| async move {
            if d.body == b"panic" {
                panic!("handler exploded");
            }
            Ok::<_, RabbitMQError>(Some(d.body))
        });
    let client = start(&broker, builder).await;

    let quick = Some(Duration::from_millis(100));
    let err = client
        .invoke_with_timeout("", "broken", "x", quick)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::CallTimeout(_)));
    let err = client
        .invoke_with_timeout("", "explosive", "panic", quick)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::CallTimeout(_)));

    assert_eq!(client.invoke("", "echo", "still here").await.unwrap(), b"still here");
    assert_eq!(client.invoke("", "explosive", "calm").await.unwrap(), b"calm");

    // failed deliveries are rejected without requeue by default
    eventually(|| broker.unacked_count() == 0).await;
    assert_eq!(broker.message_count("broken"), Some(0));
    assert!(client.is_running());
}

#[tokio::test]
async fn failed_deliveries_can_be_requeued() {
    let broker = InMemoryBroker::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    let builder = RabbitMQClient::builder()
        .requeue_on_error(true)
        .register_default("flaky", move |d: Delivery| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                if !d.redelivered {
                    return Err(RabbitMQError::handler("first attempt fails"));
                }
                Ok(Some(d.body))
            }
        });
    let client = start(&broker, builder).await;

    let reply = client.invoke("", "flaky", "retry me").await.unwrap();
    assert_eq!(reply, b"retry me");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn json_calls_round_trip_typed_values() {
    #[derive(Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sum {
        total: i64,
    }

    let broker = InMemoryBroker::new();
    let builder = RabbitMQClient::builder().register_default(
        "adder",
        JsonHandler::new(|req: Add| async move { Ok(Sum { total: req.a + req.b }) }),
    );
    let client = start(&broker, builder).await;

    let sum: Sum = client
        .invoke_json("", "adder", &Add { a: 2, b: 40 })
        .await
        .unwrap();
    assert_eq!(sum, Sum { total: 42 });

    // a request the handler cannot decode gets no reply
    let err = client
        .invoke_with_timeout("", "adder", "not json", Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::CallTimeout(_)));
}

#[tokio::test]
async fn fire_and_forget_messages_are_handled_and_acked() {
    let broker = InMemoryBroker::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let builder = RabbitMQClient::builder().register_default("events", move |_d: Delivery| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RabbitMQError>(Some(b"ignored".to_vec()))
        }
    });
    let client = start(&broker, builder).await;

    client.publish("", "events", "one").await.unwrap();
    client.publish_json("", "events", &serde_json::json!({"n": 2})).await.unwrap();
    client
        .publish_with_correlation("", "events", "three", "manual-id")
        .await
        .unwrap();

    eventually(|| handled.load(Ordering::SeqCst) == 3).await;
    eventually(|| broker.unacked_count() == 0).await;
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn redeclaring_the_same_queue_is_idempotent() {
    let broker = InMemoryBroker::new();
    let first = start(&broker, echo_builder()).await;
    let second = start(&broker, echo_builder()).await;

    assert_eq!(broker.queue_names(), vec!["echo".to_string()]);
    assert_eq!(broker.consumer_count("echo"), Some(2));
    assert_eq!(second.invoke("", "echo", "a").await.unwrap(), b"a");
    assert_eq!(first.invoke("", "echo", "b").await.unwrap(), b"b");

    let conflicting = QueueOptions {
        durable: true,
        ..QueueOptions::default()
    };
    let err = first
        .topology()
        .declare_queue("echo", &conflicting)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::TopologyConflict(_)));

    // the conflict cost the caller channel, not the client
    assert_eq!(first.invoke("", "echo", "c").await.unwrap(), b"c");
    assert_eq!(second.invoke("", "echo", "d").await.unwrap(), b"d");
}

#[tokio::test]
async fn providers_without_consumers_are_rejected() {
    match RabbitMQClient::builder().register_provider(&SilentProvider) {
        Err(RabbitMQError::MissingCapability(name)) => assert!(name.ends_with("SilentProvider")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("provider without consumers was accepted"),
    }
}

#[tokio::test]
async fn shutdown_releases_broker_resources() {
    let broker = InMemoryBroker::new();
    let builder = echo_builder().register_provider(&PingProvider).unwrap();
    let client = start(&broker, builder).await;
    assert!(broker.exchange_exists("rpc"));
    assert_eq!(client.invoke("rpc", "rpc.ping", "bye").await.unwrap(), b"bye-ack");

    client.shutdown().await.unwrap();

    // topic-bound queues and their exchange are auto-deleted
    assert!(!broker.queue_exists("ping_queue"));
    assert!(!broker.exchange_exists("rpc"));
    assert_eq!(broker.consumer_count("echo"), Some(0));
}
