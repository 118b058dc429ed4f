// tests/connection_test.rs
// These need a running RabbitMQ; RPC_USER_NAME, RPC_PASSWORD and RPC_HOST
// must point at it (a .env file works too).

use rabbit_rpc::rabbitmq::{ConnectionManager, Delivery};
use rabbit_rpc::{BrokerConfig, RabbitMQClient, RabbitMQError};
use std::time::Duration;

fn live_config() -> BrokerConfig {
    BrokerConfig::from_env().expect("RPC_* environment variables are required for live tests")
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_connection_establishes() {
    let config = live_config();
    let connection = ConnectionManager::from_config(&config)
        .with_reconnect_policy(1, 100)
        .connect()
        .await
        .expect("Failed to connect");
    assert!(connection.is_connected());
}

#[tokio::test]
#[ignore]
async fn test_ping_round_trip() {
    let config = live_config();
    let client = RabbitMQClient::builder()
        .register_topic("rpc_it", "rpc_it.ping", "rpc_it_ping", |d: Delivery| async move {
            Ok::<_, RabbitMQError>(Some(format!("{}-ack", d.body_str()).into_bytes()))
        })
        .connect(&config)
        .await
        .expect("Failed to start client");

    let reply = client.invoke("rpc_it", "rpc_it.ping", "hello").await.unwrap();
    assert_eq!(reply, b"hello-ack");

    let err = client
        .invoke_with_timeout("rpc_it", "rpc_it.nobody", "hello", Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::CallTimeout(_)));
    assert_eq!(client.pending_calls(), 0);

    client.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_missing_exchange_fails_publish_then_recovers() {
    let config = live_config();
    let client = RabbitMQClient::builder()
        .register_default("rpc_it_echo", |d: Delivery| async move {
            Ok::<_, RabbitMQError>(Some(d.body))
        })
        .connect(&config)
        .await
        .expect("Failed to start client");

    let err = client
        .invoke("rpc_it_no_such_exchange", "any.key", "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::PublishFailure(_)), "{err}");
    assert_eq!(client.pending_calls(), 0);

    let reply = client.invoke("", "rpc_it_echo", "again").await.unwrap();
    assert_eq!(reply, b"again");

    client.shutdown().await.unwrap();
}
