//! Single-process broker with the delivery semantics the pipeline relies on:
//! topic routing, durable-queue buffering, one unacked message per
//! subscription, and redelivery of messages that were never acknowledged.
//!
//! Used by the tests and by `BROKER=memory` when running the order service
//! and the consumer in one process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::broker::{topic_matches, Broker, Delivery, MessagingError, OutboundMessage, Subscription};

/// How many published messages `published()` remembers.
pub const PUBLISHED_HISTORY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    acked: usize,
}

#[derive(Default)]
struct State {
    unavailable: bool,
    closed: bool,
    // bumped to cut off every live subscription
    generation: u64,
    // (queue, binding pattern)
    bindings: Vec<(String, String)>,
    queues: HashMap<String, QueueState>,
    published: VecDeque<PublishedMessage>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable, publish and subscribe fail.
    pub fn set_available(&self, available: bool) {
        self.shared.state().unavailable = !available;
    }

    /// The most recent messages accepted by `publish`, routed or not,
    /// oldest first. At most [`PUBLISHED_HISTORY`] are kept.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state().published.iter().cloned().collect()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.shared
            .state()
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Messages waiting in `queue` that have not been handed to a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn acked_count(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.acked)
            .unwrap_or(0)
    }

    /// Simulate a dropped consumer connection: every open subscription ends.
    /// Unacked deliveries go back to their queue; new subscriptions work.
    pub fn disconnect_consumers(&self) {
        self.shared.state().generation += 1;
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, routing_key: &str, message: OutboundMessage) -> Result<(), MessagingError> {
        {
            let mut state = self.shared.state();

            if state.unavailable {
                return Err(MessagingError::Unavailable("in-memory broker is offline".to_string()));
            }

            if state.published.len() == PUBLISHED_HISTORY {
                state.published.pop_front();
            }
            state.published.push_back(PublishedMessage {
                routing_key: routing_key.to_string(),
                message_id: message.message_id.clone(),
                body: message.body.clone(),
            });

            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(_, pattern)| topic_matches(pattern, routing_key))
                .map(|(queue, _)| queue.clone())
                .collect();

            for queue in targets {
                state.queues.entry(queue).or_default().ready.push_back(Stored {
                    body: message.body.clone(),
                    redelivered: false,
                });
            }
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, routing_key: &str) -> Result<(), MessagingError> {
        let mut state = self.shared.state();

        if state.unavailable {
            return Err(MessagingError::Unavailable("in-memory broker is offline".to_string()));
        }

        state.queues.entry(queue.to_string()).or_default();

        let binding = (queue.to_string(), routing_key.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, MessagingError> {
        let state = self.shared.state();

        if state.unavailable {
            return Err(MessagingError::Unavailable("in-memory broker is offline".to_string()));
        }
        if state.closed {
            return Err(MessagingError::Unavailable("in-memory broker is closed".to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Consume(format!("queue '{queue}' is not declared")));
        }

        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            generation: state.generation,
            in_flight: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) {
        self.shared.state().closed = true;
        self.shared.notify.notify_waiters();
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    generation: u64,
    // prefetch = 1: set while a delivery is neither acked nor dropped
    in_flight: Arc<AtomicBool>,
}

impl InMemorySubscription {
    fn try_take(&self) -> Option<Option<Stored>> {
        let mut state = self.shared.state();

        if state.closed || state.generation != self.generation {
            return Some(None);
        }
        if self.in_flight.load(Ordering::SeqCst) {
            return None;
        }

        let msg = state.queues.get_mut(&self.queue)?.ready.pop_front()?;
        self.in_flight.store(true, Ordering::SeqCst);
        Some(Some(msg))
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Box<dyn Delivery>, MessagingError>> {
        loop {
            let notified = self.shared.notify.notified();

            match self.try_take() {
                Some(Some(message)) => {
                    return Some(Ok(Box::new(InMemoryDelivery {
                        shared: Arc::clone(&self.shared),
                        queue: self.queue.clone(),
                        message,
                        in_flight: Arc::clone(&self.in_flight),
                        settled: false,
                    })));
                }
                Some(None) => return None,
                None => notified.await,
            }
        }
    }
}

struct InMemoryDelivery {
    shared: Arc<Shared>,
    queue: String,
    message: Stored,
    in_flight: Arc<AtomicBool>,
    settled: bool,
}

impl InMemoryDelivery {
    fn release(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), MessagingError> {
        let mut this = self;
        {
            let mut state = this.shared.state();
            state.queues.entry(this.queue.clone()).or_default().acked += 1;
        }

        this.settled = true;
        this.release();
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        {
            let mut state = self.shared.state();
            let mut message = self.message.clone();
            message.redelivered = true;
            state
                .queues
                .entry(self.queue.clone())
                .or_default()
                .ready
                .push_front(message);
        }

        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(body: &str) -> OutboundMessage {
        OutboundMessage::json(None, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn routes_by_binding_and_keeps_fifo() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "order.created").await.unwrap();

        broker.publish("order.created", msg("1")).await.unwrap();
        broker.publish("order.other", msg("x")).await.unwrap();
        broker.publish("order.created", msg("2")).await.unwrap();

        assert_eq!(broker.published().len(), 3);
        assert_eq!(broker.queue_depth("q"), 2);

        let mut sub = broker.subscribe("q").await.unwrap();
        let d1 = sub.next_delivery().await.unwrap().unwrap();
        assert_eq!(d1.body(), b"1");
        d1.ack().await.unwrap();

        let d2 = sub.next_delivery().await.unwrap().unwrap();
        assert_eq!(d2.body(), b"2");
        d2.ack().await.unwrap();

        assert_eq!(broker.acked_count("q"), 2);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn second_delivery_waits_for_ack() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "k").await.unwrap();
        broker.publish("k", msg("1")).await.unwrap();
        broker.publish("k", msg("2")).await.unwrap();

        let mut sub = broker.subscribe("q").await.unwrap();
        let first = sub.next_delivery().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next_delivery()).await;
        assert!(blocked.is_err(), "prefetch of one must hold back the second message");

        first.ack().await.unwrap();
        let second = sub.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.body(), b"2");
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "k").await.unwrap();
        broker.publish("k", msg("1")).await.unwrap();

        let mut sub = broker.subscribe("q").await.unwrap();
        let d = sub.next_delivery().await.unwrap().unwrap();
        assert!(!d.redelivered());
        drop(d);

        let again = sub.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.body(), b"1");
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn offline_broker_rejects_publish() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(
            broker.publish("k", msg("1")).await,
            Err(MessagingError::Unavailable(_))
        ));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "k").await.unwrap();
        let mut sub = broker.subscribe("q").await.unwrap();

        broker.close().await;
        assert!(sub.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn closed_broker_refuses_new_subscriptions() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "k").await.unwrap();
        broker.close().await;
        assert!(broker.subscribe("q").await.is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_subscriptions_but_keeps_messages() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", "k").await.unwrap();
        broker.publish("k", msg("1")).await.unwrap();

        let mut old = broker.subscribe("q").await.unwrap();
        let unacked = old.next_delivery().await.unwrap().unwrap();

        broker.disconnect_consumers();
        assert!(old.next_delivery().await.is_none());
        drop(unacked);

        let mut fresh = broker.subscribe("q").await.unwrap();
        let again = fresh.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.body(), b"1");
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn published_history_is_bounded() {
        let broker = InMemoryBroker::new();
        for i in 0..PUBLISHED_HISTORY + 5 {
            broker.publish("k", msg(&i.to_string())).await.unwrap();
        }

        let kept = broker.published();
        assert_eq!(kept.len(), PUBLISHED_HISTORY);
        assert_eq!(kept[0].body, b"5".to_vec());
    }

    #[tokio::test]
    async fn subscribing_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        assert!(broker.subscribe("nope").await.is_err());
    }
}
