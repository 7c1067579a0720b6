use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mongodb::Client;
use tracing_subscriber::EnvFilter;

use orderflow::{
    config,
    routes,
    services::{
        amqp_broker::{AmqpBroker, AmqpOptions},
        auth_client::TokenVerifier,
        broker::Broker,
        db_init,
        event_consumer::EventConsumer,
        event_publisher::EventPublisher,
        in_memory_broker::InMemoryBroker,
        mongo_order_store::MongoOrderStore,
        notification::{LogSender, NotificationDispatcher},
        order_store::{InMemoryOrderStore, OrderStore},
        stock_validator::StockValidator,
    },
    AppState,
};

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = config::load();

    let orders: Arc<dyn OrderStore> = match settings.order_store.as_str() {
        "memory" => {
            tracing::warn!("using in-memory order store, orders will not survive a restart");
            Arc::new(InMemoryOrderStore::new())
        }
        _ => {
            let client = Client::with_uri_str(&settings.mongodb_uri)
                .await
                .expect("Failed to connect to MongoDB");
            let db = client.database(&settings.mongodb_db);

            if let Err(e) = db_init::ensure_indexes(&db).await {
                tracing::warn!("could not create indexes: {e}");
            }
            Arc::new(MongoOrderStore::new(db))
        }
    };

    // Connects lazily on first publish.
    let broker: Arc<dyn Broker> = match settings.broker.as_str() {
        "memory" => Arc::new(InMemoryBroker::new()),
        _ => Arc::new(AmqpBroker::new(AmqpOptions::from_settings(&settings))),
    };

    let auth = match settings.auth_mode.as_str() {
        "jwt" => TokenVerifier::jwt(settings.jwt_secret.clone()),
        _ => TokenVerifier::remote(settings.user_service_url.clone())
            .expect("Failed to build user service client"),
    };

    // BROKER=memory: nothing outside this process can consume, so the
    // notification consumer runs here against the same broker.
    let (stop_consumer, consumer_stopped) = tokio::sync::oneshot::channel::<()>();
    let in_process_consumer = match settings.broker.as_str() {
        "memory" => {
            if let Err(e) = broker.declare_queue(&settings.queue, &settings.routing_key).await {
                tracing::error!("could not set up queue '{}': {e}", settings.queue);
            }

            let mut consumer = EventConsumer::new(
                NotificationDispatcher::new(Arc::new(LogSender)),
                broker.clone(),
                settings.consumer_failure_policy,
                settings.dead_letter_routing_key.clone(),
                settings.consumer_dedup_capacity,
            );
            let queue = settings.queue.clone();
            let routing_key = settings.routing_key.clone();

            Some(tokio::spawn(async move {
                let stop = async {
                    let _ = consumer_stopped.await;
                };
                if let Err(e) = consumer.consume(&queue, &routing_key, stop).await {
                    tracing::error!("in-process consumer stopped: {e}");
                }
            }))
        }
        _ => None,
    };

    let state = AppState {
        orders,
        products: StockValidator::new(
            settings.product_service_url.clone(),
            Duration::from_secs(settings.product_service_timeout_secs),
        )
        .expect("Failed to build product service client"),
        auth,
        publisher: EventPublisher::new(
            broker.clone(),
            settings.routing_key.clone(),
            Duration::from_millis(settings.publish_timeout_ms),
        ),
        settings: settings.clone(),
    };

    let app = routes::app(state);

    let addr = SocketAddr::from((
        settings
            .host
            .parse::<std::net::IpAddr>()
            .expect("HOST must be an IP address"),
        settings.port,
    ));
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("server error: {e}");
    }

    let _ = stop_consumer.send(());
    if let Some(handle) = in_process_consumer {
        let _ = handle.await;
    }

    broker.close().await;
}
