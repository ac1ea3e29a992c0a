use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use webhook_relay::{
    DeliveryWorker, Dispatcher, DispatcherConfig, InMemoryRegistry, WebhookConfig, WebhookId,
    WorkerConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DispatcherConfig::default();
    let registry = Arc::new(InMemoryRegistry::new(config.max_retry_bound));
    registry
        .register(
            WebhookConfig::new("orders", "https://example.com/webhook", "supersecret", ["order.created"])
                .with_name("Order feed")
                .with_retry_count(3),
        )
        .await?;

    let dispatcher = Arc::new(Dispatcher::new(config)?.with_registry(registry));
    let mut worker = DeliveryWorker::spawn(dispatcher.clone(), WorkerConfig::default());

    let record = dispatcher
        .enqueue_delivery(&WebhookId::new("orders"), "order.created", json!({"id": 123}))
        .await?;
    println!("queued delivery {}", record.id);

    tokio::time::sleep(Duration::from_secs(2)).await;
    for delivery in dispatcher.get_deliveries(&WebhookId::new("orders")).await? {
        println!(
            "{} status={:?} code={:?} retries={}",
            delivery.id, delivery.status, delivery.status_code, delivery.retry_count
        );
    }

    worker.shutdown().await;
    Ok(())
}
