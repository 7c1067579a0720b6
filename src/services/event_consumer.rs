//! Notification side of the pipeline: pulls order events off the queue one
//! at a time and hands `order.created` to the dispatcher.
//!
//! Every delivery is acknowledged once handled, whatever happened while
//! handling it. Messages that cannot be understood are either dropped or
//! copied to the dead-letter routing key first, depending on
//! [`FailurePolicy`]. Neither path ever leads to a redelivery.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::broker::{Broker, Delivery, MessagingError, OutboundMessage, Subscription};
use super::notification::NotificationDispatcher;
use crate::models::{EventEnvelope, OrderEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and discard.
    Drop,
    /// Republish the raw body to the dead-letter routing key, then discard.
    DeadLetter,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(FailurePolicy::Drop),
            "dead-letter" | "dead_letter" | "deadletter" => Ok(FailurePolicy::DeadLetter),
            other => Err(format!("unknown consumer failure policy '{other}'")),
        }
    }
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Dispatch was attempted; `delivered` is the sender's answer.
    Dispatched { order_id: i64, delivered: bool },
    /// Same event id already handled by this consumer.
    Duplicate(Uuid),
    /// Event name this consumer does not handle.
    Ignored(String),
    /// Undecodable body or unsupported version.
    Rejected(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Dispatched { order_id, delivered } => {
                write!(f, "dispatched order {order_id} (delivered: {delivered})")
            }
            Outcome::Duplicate(id) => write!(f, "duplicate event {id}"),
            Outcome::Ignored(event) => write!(f, "ignored event '{event}'"),
            Outcome::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Why [`EventConsumer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    /// The subscription ended or failed (closed broker, dropped connection).
    SubscriptionLost,
}

const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(200);

/// Bounded window of recently processed event ids.
struct RecentIds {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: Uuid) {
        if self.capacity == 0 || !self.seen.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

pub struct EventConsumer {
    dispatcher: NotificationDispatcher,
    broker: Arc<dyn Broker>,
    policy: FailurePolicy,
    dead_letter_key: String,
    recent: RecentIds,
    resubscribe_delay: Duration,
}

impl EventConsumer {
    pub fn new(
        dispatcher: NotificationDispatcher,
        broker: Arc<dyn Broker>,
        policy: FailurePolicy,
        dead_letter_key: impl Into<String>,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            dispatcher,
            broker,
            policy,
            dead_letter_key: dead_letter_key.into(),
            recent: RecentIds::new(dedup_capacity),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Pause between losing a subscription and opening the next one.
    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Decode and act on one message body. Never fails: every problem is
    /// folded into the returned [`Outcome`].
    pub async fn handle(&mut self, body: &[u8]) -> Outcome {
        let envelope = match EventEnvelope::from_slice(body) {
            Ok(env) => env,
            Err(e) => return Outcome::Rejected(e.to_string()),
        };

        tracing::info!(event = %envelope.event, version = envelope.version, id = ?envelope.id, "received event");

        if let Some(id) = envelope.id {
            if self.recent.contains(&id) {
                return Outcome::Duplicate(id);
            }
        }

        let outcome = match envelope.decode() {
            Ok(OrderEvent::Created(order)) => {
                let delivered = match self.dispatcher.notify(&order).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(order_id = order.order_id, error = %e, "notification send failed");
                        false
                    }
                };
                Outcome::Dispatched {
                    order_id: order.order_id,
                    delivered,
                }
            }
            Ok(OrderEvent::Unknown(event)) => Outcome::Ignored(event),
            Err(e) => Outcome::Rejected(e.to_string()),
        };

        if let (Some(id), Outcome::Dispatched { .. }) = (envelope.id, &outcome) {
            self.recent.insert(id);
        }
        outcome
    }

    /// Handle one delivery and acknowledge it.
    pub async fn process(&mut self, delivery: Box<dyn Delivery>) -> Outcome {
        if delivery.redelivered() {
            tracing::warn!("processing a redelivered message");
        }

        let body = delivery.body().to_vec();
        let outcome = self.handle(&body).await;

        match &outcome {
            Outcome::Dispatched { .. } => tracing::info!(%outcome, "event processed"),
            Outcome::Duplicate(_) | Outcome::Ignored(_) => tracing::warn!(%outcome, "event skipped"),
            Outcome::Rejected(_) => {
                tracing::error!(%outcome, "event could not be processed");
                if self.policy == FailurePolicy::DeadLetter {
                    self.dead_letter(body).await;
                }
            }
        }

        if let Err(e) = delivery.ack().await {
            tracing::error!(error = %e, "failed to acknowledge message");
        }
        outcome
    }

    async fn dead_letter(&self, body: Vec<u8>) {
        let message = OutboundMessage::json(None, body);

        match self.broker.publish(&self.dead_letter_key, message).await {
            Ok(()) => tracing::info!(routing_key = %self.dead_letter_key, "message dead-lettered"),
            Err(e) => tracing::error!(error = %e, "dead-lettering failed, message dropped"),
        }
    }

    /// Consume one subscription until it ends or `shutdown` resolves.
    pub async fn run(&mut self, mut subscription: Box<dyn Subscription>, shutdown: impl Future<Output = ()>) -> RunExit {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("consumer stopping");
                    return RunExit::Shutdown;
                }
                next = subscription.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        self.process(delivery).await;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "subscription failed");
                        return RunExit::SubscriptionLost;
                    }
                    None => {
                        tracing::warn!("subscription ended");
                        return RunExit::SubscriptionLost;
                    }
                }
            }
        }
    }

    /// Declare `queue`, subscribe, and keep consuming until `shutdown`
    /// resolves. A lost subscription is declared and opened again; the
    /// broker's own reconnect backoff applies. Returns an error only when
    /// the broker cannot be reached to resubscribe.
    pub async fn consume(
        &mut self,
        queue: &str,
        routing_key: &str,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), MessagingError> {
        tokio::pin!(shutdown);
        let broker = Arc::clone(&self.broker);
        let mut attempt: u64 = 0;

        loop {
            if attempt > 0 {
                tokio::select! {
                    _ = &mut shutdown => return Ok(()),
                    _ = tokio::time::sleep(self.resubscribe_delay) => {}
                }
                tracing::info!(queue, attempt, "resubscribing");
            }
            attempt += 1;

            broker.declare_queue(queue, routing_key).await?;
            let subscription = broker.subscribe(queue).await?;

            if self.run(subscription, &mut shutdown).await == RunExit::Shutdown {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses() {
        assert_eq!("drop".parse(), Ok(FailurePolicy::Drop));
        assert_eq!("Dead-Letter".parse(), Ok(FailurePolicy::DeadLetter));
        assert!("retry".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn recent_ids_forget_oldest() {
        let mut r = RecentIds::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        r.insert(a);
        r.insert(b);
        r.insert(c);

        assert!(!r.contains(&a));
        assert!(r.contains(&b));
        assert!(r.contains(&c));
    }

    #[test]
    fn zero_capacity_disables_dedup() {
        let mut r = RecentIds::new(0);
        let a = Uuid::new_v4();
        r.insert(a);
        assert!(!r.contains(&a));
    }
}
