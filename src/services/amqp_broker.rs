use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;

use super::broker::{Broker, Delivery, MessagingError, OutboundMessage, Subscription};
use crate::config::Settings;

const PERSISTENT: u8 = 2;

#[derive(Debug, Clone)]
pub struct AmqpOptions {
    pub url: String,
    pub exchange: String,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl AmqpOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            url: settings.amqp_url.clone(),
            exchange: settings.exchange.clone(),
            reconnect_attempts: settings.broker_reconnect_attempts.max(1),
            reconnect_backoff: Duration::from_millis(settings.broker_reconnect_backoff_ms),
        }
    }
}

struct Session {
    connection: Connection,
    channel: Channel,
}

/// RabbitMQ broker. The connection and publishing channel are opened on
/// first use, shared by every caller, and reopened (with backoff) after they
/// drop. `close` releases them.
pub struct AmqpBroker {
    opts: AmqpOptions,
    session: Mutex<Option<Session>>,
}

impl AmqpBroker {
    pub fn new(opts: AmqpOptions) -> Self {
        Self {
            opts,
            session: Mutex::new(None),
        }
    }

    async fn open_session(&self) -> Result<Session, lapin::Error> {
        let connection = Connection::connect(&self.opts.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.opts.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(exchange = %self.opts.exchange, "connected to broker");
        Ok(Session { connection, channel })
    }

    async fn connect_with_backoff(&self) -> Result<Session, MessagingError> {
        let mut delay = self.opts.reconnect_backoff;
        let mut last_err = String::new();

        for attempt in 1..=self.opts.reconnect_attempts {
            match self.open_session().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "broker connection attempt failed");
                    last_err = e.to_string();
                }
            }

            if attempt < self.opts.reconnect_attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
        }

        Err(MessagingError::Unavailable(last_err))
    }

    /// The shared channel, reconnecting if the previous one is gone.
    async fn channel(&self) -> Result<Channel, MessagingError> {
        let mut guard = self.session.lock().await;

        if let Some(s) = guard.as_ref() {
            if s.connection.status().connected() && s.channel.status().connected() {
                return Ok(s.channel.clone());
            }
            tracing::warn!("broker channel lost, reconnecting");
        }

        let session = self.connect_with_backoff().await?;
        let channel = session.channel.clone();
        *guard = Some(session);
        Ok(channel)
    }

    async fn invalidate(&self) {
        self.session.lock().await.take();
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<(), MessagingError> {
        let channel = self.channel().await?;

        let mut props = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());
        if let Some(id) = message.message_id {
            props = props.with_message_id(id.into());
        }

        let res = async {
            channel
                .basic_publish(
                    &self.opts.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &message.body,
                    props,
                )
                .await?
                .await
        }
        .await;

        if let Err(e) = res {
            self.invalidate().await;
            return Err(MessagingError::Publish(e.to_string()));
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, routing_key: &str) -> Result<(), MessagingError> {
        let channel = self.channel().await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume(e.to_string()))?;

        channel
            .queue_bind(
                queue,
                &self.opts.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume(e.to_string()))?;

        tracing::info!(queue, exchange = %self.opts.exchange, routing_key, "queue bound");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, MessagingError> {
        // consumers get their own channel so QoS does not affect publishing
        self.channel().await?;
        let channel = {
            let guard = self.session.lock().await;
            let Some(s) = guard.as_ref() else {
                return Err(MessagingError::Unavailable("no broker session".to_string()));
            };
            s.connection
                .create_channel()
                .await
                .map_err(|e| MessagingError::Consume(e.to_string()))?
        };

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::Consume(e.to_string()))?;

        let consumer = channel
            .basic_consume(
                queue,
                "notification-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume(e.to_string()))?;

        tracing::info!(queue, "consuming with prefetch=1");
        Ok(Box::new(AmqpSubscription { _channel: channel, consumer }))
    }

    async fn close(&self) {
        if let Some(s) = self.session.lock().await.take() {
            if let Err(e) = s.channel.close(200, "bye").await {
                tracing::warn!(error = %e, "error closing broker channel");
            }
            if let Err(e) = s.connection.close(200, "bye").await {
                tracing::warn!(error = %e, "error closing broker connection");
            } else {
                tracing::info!("broker connection closed");
            }
        }
    }
}

struct AmqpSubscription {
    _channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, MessagingError>> {
        let next = self.consumer.next().await?;

        Some(
            next.map(|d| Box::new(AmqpDelivery(d)) as Box<dyn Delivery>)
                .map_err(|e| MessagingError::Consume(e.to_string())),
        )
    }
}

struct AmqpDelivery(LapinDelivery);

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn redelivered(&self) -> bool {
        self.0.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), MessagingError> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::Consume(e.to_string()))
    }
}
