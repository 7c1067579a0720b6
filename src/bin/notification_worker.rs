use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use orderflow::{
    config,
    services::{
        amqp_broker::{AmqpBroker, AmqpOptions},
        broker::Broker,
        event_consumer::{EventConsumer, FailurePolicy},
        notification::{LogSender, NotificationDispatcher},
    },
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = config::load();
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(AmqpOptions::from_settings(&settings)));

    if settings.consumer_failure_policy == FailurePolicy::DeadLetter {
        let dlq = format!("{}.dead-letter", settings.queue);
        if let Err(e) = broker.declare_queue(&dlq, &settings.dead_letter_routing_key).await {
            tracing::error!("could not set up dead-letter queue '{dlq}': {e}");
            std::process::exit(1);
        }
    }

    tracing::info!(
        queue = %settings.queue,
        routing_key = %settings.routing_key,
        policy = ?settings.consumer_failure_policy,
        "notification worker started"
    );

    let mut consumer = EventConsumer::new(
        NotificationDispatcher::new(Arc::new(LogSender)),
        broker.clone(),
        settings.consumer_failure_policy,
        settings.dead_letter_routing_key.clone(),
        settings.consumer_dedup_capacity,
    )
    .with_resubscribe_delay(Duration::from_millis(settings.broker_reconnect_backoff_ms));

    let result = consumer
        .consume(&settings.queue, &settings.routing_key, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    broker.close().await;

    // a non-zero exit lets the supervisor restart the worker
    if let Err(e) = result {
        tracing::error!("lost the broker and could not resubscribe to '{}': {e}", settings.queue);
        std::process::exit(1);
    }
}
