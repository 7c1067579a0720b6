//! Message broker seam shared by the publisher (order service) and the
//! consumer (notification worker).

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),
}

/// A persistent JSON message ready to be routed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: Option<String>,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn json(message_id: Option<String>, body: Vec<u8>) -> Self {
        Self { message_id, body }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Route a persistent message through the exchange.
    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<(), MessagingError>;

    /// Declare a durable queue and bind it to the exchange. Idempotent.
    async fn declare_queue(&self, queue: &str, routing_key: &str) -> Result<(), MessagingError>;

    /// Start consuming `queue` with a prefetch of one.
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, MessagingError>;

    /// Release connections. Later calls may reconnect.
    async fn close(&self);
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` once the subscription has ended.
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, MessagingError>>;
}

/// A message handed to a consumer. Dropping it without `ack` leaves it
/// unacknowledged, so the broker will deliver it again.
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    fn redelivered(&self) -> bool;

    async fn ack(self: Box<Self>) -> Result<(), MessagingError>;
}

/// AMQP topic matching: words split on '.', `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&p[1..], k) || (!k.is_empty() && go(p, &k[1..])),
            (Some(&"*"), Some(_)) => go(&p[1..], &k[1..]),
            (Some(pw), Some(kw)) if pw == kw => go(&p[1..], &k[1..]),
            _ => false,
        }
    }

    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = routing_key.split('.').collect();
    go(&p, &k)
}
