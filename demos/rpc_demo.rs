// demos/rpc_demo.rs
use anyhow::Result;
use rabbit_rpc::rabbitmq::JsonHandler;
use rabbit_rpc::{BrokerConfig, HandlerRegistry, RabbitMQClient, RpcProvider};
use serde::{Deserialize, Serialize};

const EXCHANGE: &str = "calculations";

#[derive(Debug, Serialize, Deserialize)]
struct CalculationRequest {
    values: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalculationResponse {
    result: f64,
}

struct Calculator;

impl RpcProvider for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn declare(&self, registry: &mut HandlerRegistry) -> rabbit_rpc::Result<()> {
        registry.register_topic(
            EXCHANGE,
            "calc.add",
            "calc_add",
            JsonHandler::new(|request: CalculationRequest| async move {
                Ok(CalculationResponse {
                    result: request.values.iter().sum(),
                })
            }),
        );
        registry.register_topic(
            EXCHANGE,
            "calc.multiply",
            "calc_multiply",
            JsonHandler::new(|request: CalculationRequest| async move {
                Ok(CalculationResponse {
                    result: request.values.iter().product(),
                })
            }),
        );
        Ok(())
    }
}

async fn run_server(config: &BrokerConfig) -> Result<()> {
    let client = RabbitMQClient::builder()
        .register_provider(&Calculator)?
        .connect(config)
        .await?;

    println!("RPC Server started. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;
    client.shutdown().await?;
    Ok(())
}

async fn run_client(config: &BrokerConfig) -> Result<()> {
    let client = RabbitMQClient::builder().connect(config).await?;

    let add_request = CalculationRequest {
        values: vec![1.5, 2.5, 3.5],
    };
    let add_response: CalculationResponse =
        client.invoke_json(EXCHANGE, "calc.add", &add_request).await?;
    println!("Addition result: {}", add_response.result);

    let mul_request = CalculationRequest {
        values: vec![2.0, 3.0, 4.0],
    };
    let mul_response: CalculationResponse =
        client.invoke_json(EXCHANGE, "calc.multiply", &mul_request).await?;
    println!("Multiplication result: {}", mul_response.result);

    client.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("server") => run_server(&BrokerConfig::load()?).await,
        Some("client") => run_client(&BrokerConfig::load()?).await,
        _ => {
            println!("Usage: cargo run --example rpc_demo [server|client]");
            Ok(())
        }
    }
}
