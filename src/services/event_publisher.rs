use std::sync::Arc;
use std::time::Duration;

use super::broker::{Broker, OutboundMessage};
use crate::models::{EventEnvelope, Order};

/// Publishes order events on the fixed routing key.
///
/// Publishing is best effort. By the time it runs the order row already
/// exists, so failures are logged and dropped: the notification for that
/// order is lost, the order is not.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    routing_key: String,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, routing_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            broker,
            routing_key: routing_key.into(),
            timeout,
        }
    }

    pub async fn publish_order_created(&self, order: &Order) {
        let envelope = EventEnvelope::order_created(order);

        let body = match envelope.to_vec() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(order_id = order.id, error = %e, "could not encode order.created event");
                return;
            }
        };

        let message = OutboundMessage::json(envelope.id.map(|id| id.to_string()), body);

        match tokio::time::timeout(self.timeout, self.broker.publish(&self.routing_key, message)).await {
            Ok(Ok(())) => {
                tracing::info!(order_id = order.id, routing_key = %self.routing_key, "published order.created");
            }
            Ok(Err(e)) => {
                tracing::error!(order_id = order.id, error = %e, "failed to publish order.created");
            }
            Err(_) => {
                tracing::error!(order_id = order.id, timeout = ?self.timeout, "publishing order.created timed out");
            }
        }
    }
}
