// src/main.rs
use anyhow::{Context, Result};
use rabbit_rpc::rabbitmq::{BrokerConnection, Delivery, HandlerRegistry, RpcProvider};
use rabbit_rpc::{BrokerConfig, InMemoryBroker, RabbitMQClient, RabbitMQError};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const RPC_EXCHANGE: &str = "rpc";
const PING_KEY: &str = "rpc.ping";
const PING_QUEUE: &str = "ping_queue";

/// Answers `rpc.ping` with the request body plus `-ack`.
struct PingProvider;

impl RpcProvider for PingProvider {
    fn name(&self) -> &str {
        "ping"
    }

    fn declare(&self, registry: &mut HandlerRegistry) -> rabbit_rpc::Result<()> {
        registry.register_topic(
            RPC_EXCHANGE,
            PING_KEY,
            PING_QUEUE,
            |delivery: Delivery| async move {
                info!(routing_key = %delivery.routing_key, "ping received");
                let reply = format!("{}-ack", delivery.body_str());
                Ok::<_, RabbitMQError>(Some(reply.into_bytes()))
            },
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let in_memory = std::env::args().nth(1).as_deref() == Some("memory");
    let builder = RabbitMQClient::builder().register_provider(&PingProvider)?;

    let client = if in_memory {
        info!("Using the in-process broker");
        let connection: Arc<dyn BrokerConnection> = Arc::new(InMemoryBroker::new().connect());
        builder.start(connection).await?
    } else {
        let config = BrokerConfig::load().context("Failed to load broker configuration")?;
        builder
            .connect(&config)
            .await
            .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?
    };

    let reply = client.invoke(RPC_EXCHANGE, PING_KEY, "hello").await?;
    println!("{}", String::from_utf8_lossy(&reply));

    if !in_memory {
        info!("Serving {}; press Ctrl+C to exit", PING_KEY);
        tokio::signal::ctrl_c().await?;
    }

    client.shutdown().await?;
    Ok(())
}
