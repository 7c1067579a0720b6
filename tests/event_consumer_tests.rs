use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use orderflow::{
    models::{EventEnvelope, NewOrder, Order},
    services::{
        broker::{Broker, OutboundMessage},
        event_consumer::{EventConsumer, FailurePolicy, Outcome, RunExit},
        event_publisher::EventPublisher,
        in_memory_broker::InMemoryBroker,
        notification::{NotificationDispatcher, NotificationSender},
    },
};

const QUEUE: &str = "order_notifications";
const ROUTING_KEY: &str = "order.created";
const DEAD_KEY: &str = "order.created.dead";
const DEAD_QUEUE: &str = "order_notifications.dead-letter";

#[derive(Default)]
struct RecordingSender {
    fail: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSender {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn subjects(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, recipient: &str, subject: &str, _body: &str) -> Result<(), String> {
        self.sent.lock().unwrap().push((recipient.to_string(), subject.to_string()));
        if self.fail {
            return Err("smtp relay refused".to_string());
        }
        Ok(())
    }
}

async fn setup(policy: FailurePolicy, sender: Arc<RecordingSender>) -> (InMemoryBroker, EventConsumer) {
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE, ROUTING_KEY).await.unwrap();
    broker.declare_queue(DEAD_QUEUE, DEAD_KEY).await.unwrap();

    let consumer = EventConsumer::new(
        NotificationDispatcher::new(sender),
        Arc::new(broker.clone()),
        policy,
        DEAD_KEY,
        16,
    );
    (broker, consumer)
}

fn order(id: i64) -> Order {
    NewOrder::pending(7, 5, "Mechanical Keyboard".into(), 100.0, 2).into_order(id, Utc::now())
}

async fn publish_raw(broker: &InMemoryBroker, body: Vec<u8>) {
    broker
        .publish(ROUTING_KEY, OutboundMessage::json(None, body))
        .await
        .unwrap();
}

async fn consume_one(broker: &InMemoryBroker, consumer: &mut EventConsumer) -> Outcome {
    let mut sub = broker.subscribe(QUEUE).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), sub.next_delivery())
        .await
        .expect("no delivery arrived")
        .unwrap()
        .unwrap();
    consumer.process(delivery).await
}

#[tokio::test]
async fn published_order_is_dispatched_and_acked() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender.clone()).await;

    let publisher = EventPublisher::new(Arc::new(broker.clone()), ROUTING_KEY, Duration::from_secs(1));
    publisher.publish_order_created(&order(42)).await;

    let outcome = consume_one(&broker, &mut consumer).await;
    assert_eq!(
        outcome,
        Outcome::Dispatched {
            order_id: 42,
            delivered: true
        }
    );

    let sent = sender.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("user:7".to_string(), "Order confirmation #42".to_string())]);
    assert_eq!(broker.acked_count(QUEUE), 1);
    assert_eq!(broker.queue_depth(QUEUE), 0);
}

#[tokio::test]
async fn malformed_message_is_acked_and_dropped() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender.clone()).await;

    publish_raw(&broker, b"{not json".to_vec()).await;

    let outcome = consume_one(&broker, &mut consumer).await;
    assert!(matches!(outcome, Outcome::Rejected(_)));

    assert!(sender.subjects().is_empty());
    assert_eq!(broker.acked_count(QUEUE), 1);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert!(broker.published_to(DEAD_KEY).is_empty());
}

#[tokio::test]
async fn bad_payload_is_dead_lettered_when_configured() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::DeadLetter, sender.clone()).await;

    let body = json!({ "event": "order.created", "data": { "order_id": "forty-two" } })
        .to_string()
        .into_bytes();
    publish_raw(&broker, body.clone()).await;

    let outcome = consume_one(&broker, &mut consumer).await;
    assert!(matches!(outcome, Outcome::Rejected(_)));

    let dead = broker.published_to(DEAD_KEY);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, body);
    assert_eq!(broker.queue_depth(DEAD_QUEUE), 1);

    // the original is still settled
    assert_eq!(broker.acked_count(QUEUE), 1);
    assert!(sender.subjects().is_empty());
}

#[tokio::test]
async fn unsupported_version_is_rejected() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender.clone()).await;

    let mut envelope = EventEnvelope::order_created(&order(1));
    envelope.version = 2;
    publish_raw(&broker, envelope.to_vec().unwrap()).await;

    let outcome = consume_one(&broker, &mut consumer).await;
    assert!(matches!(outcome, Outcome::Rejected(ref r) if r.contains("version 2")));
    assert_eq!(broker.acked_count(QUEUE), 1);
}

#[tokio::test]
async fn unknown_event_is_ignored_and_acked() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::DeadLetter, sender.clone()).await;

    let body = json!({ "event": "order.refunded", "data": {} }).to_string().into_bytes();
    publish_raw(&broker, body).await;

    let outcome = consume_one(&broker, &mut consumer).await;
    assert_eq!(outcome, Outcome::Ignored("order.refunded".to_string()));

    assert!(sender.subjects().is_empty());
    assert_eq!(broker.acked_count(QUEUE), 1);
    assert!(broker.published_to(DEAD_KEY).is_empty());
}

#[tokio::test]
async fn legacy_envelope_without_id_or_version_is_accepted() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender.clone()).await;

    let o = order(9);
    let body = json!({
        "event": "order.created",
        "data": {
            "order_id": o.id,
            "user_id": o.user_id,
            "product_id": o.product_id,
            "product_name": o.product_name,
            "quantity": o.quantity,
            "unit_price": o.unit_price,
            "total_price": o.total_price,
            "status": "pending",
            "created_at": o.created_at
        }
    })
    .to_string()
    .into_bytes();
    publish_raw(&broker, body).await;

    let outcome = consume_one(&broker, &mut consumer).await;
    assert_eq!(
        outcome,
        Outcome::Dispatched {
            order_id: 9,
            delivered: true
        }
    );
}

#[tokio::test]
async fn failed_send_is_still_acked() {
    let sender = Arc::new(RecordingSender::failing());
    let (broker, mut consumer) = setup(FailurePolicy::DeadLetter, sender.clone()).await;

    let envelope = EventEnvelope::order_created(&order(3));
    publish_raw(&broker, envelope.to_vec().unwrap()).await;

    let outcome = consume_one(&broker, &mut consumer).await;
    assert_eq!(
        outcome,
        Outcome::Dispatched {
            order_id: 3,
            delivered: false
        }
    );

    assert_eq!(sender.subjects().len(), 1);
    assert_eq!(broker.acked_count(QUEUE), 1);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    // send failures are not decode failures
    assert!(broker.published_to(DEAD_KEY).is_empty());
}

#[tokio::test]
async fn duplicate_event_id_notifies_once() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender.clone()).await;

    let envelope = EventEnvelope::order_created(&order(5));
    let body = envelope.to_vec().unwrap();
    publish_raw(&broker, body.clone()).await;
    publish_raw(&broker, body).await;

    let first = consume_one(&broker, &mut consumer).await;
    let second = consume_one(&broker, &mut consumer).await;

    assert!(matches!(first, Outcome::Dispatched { order_id: 5, .. }));
    assert_eq!(second, Outcome::Duplicate(envelope.id.unwrap()));
    assert_eq!(sender.subjects().len(), 1);
    assert_eq!(broker.acked_count(QUEUE), 2);
}

#[tokio::test]
async fn unacked_delivery_comes_back_after_a_crash() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender.clone()).await;

    let envelope = EventEnvelope::order_created(&order(11));
    publish_raw(&broker, envelope.to_vec().unwrap()).await;

    {
        // worker takes the message and dies before acking
        let mut sub = broker.subscribe(QUEUE).await.unwrap();
        let delivery = sub.next_delivery().await.unwrap().unwrap();
        assert!(!delivery.redelivered());
    }
    assert_eq!(broker.queue_depth(QUEUE), 1);

    let mut sub = broker.subscribe(QUEUE).await.unwrap();
    let delivery = sub.next_delivery().await.unwrap().unwrap();
    assert!(delivery.redelivered());

    let outcome = consumer.process(delivery).await;
    assert!(matches!(outcome, Outcome::Dispatched { order_id: 11, .. }));
    assert_eq!(broker.acked_count(QUEUE), 1);
}

#[tokio::test]
async fn run_processes_in_order_until_shutdown() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender.clone()).await;

    let publisher = EventPublisher::new(Arc::new(broker.clone()), ROUTING_KEY, Duration::from_secs(1));
    for id in 1..=3 {
        publisher.publish_order_created(&order(id)).await;
    }

    let subscription = broker.subscribe(QUEUE).await.unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let worker = tokio::spawn(async move {
        consumer
            .run(subscription, async {
                let _ = stop_rx.await;
            })
            .await;
    });

    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.acked_count(QUEUE) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker did not drain the queue");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("worker did not stop")
        .unwrap();

    assert_eq!(
        sender.subjects(),
        vec![
            "Order confirmation #1".to_string(),
            "Order confirmation #2".to_string(),
            "Order confirmation #3".to_string(),
        ]
    );
}

#[tokio::test]
async fn run_ends_when_broker_closes() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, mut consumer) = setup(FailurePolicy::Drop, sender).await;

    let subscription = broker.subscribe(QUEUE).await.unwrap();
    let closer = broker.clone();

    let worker = tokio::spawn(async move { consumer.run(subscription, std::future::pending::<()>()).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    closer.close().await;

    let exit = tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("worker did not stop after close")
        .unwrap();
    assert_eq!(exit, RunExit::SubscriptionLost);
}

async fn wait_for_acks(broker: &InMemoryBroker, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.acked_count(QUEUE) < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("messages were not consumed");
}

#[tokio::test]
async fn consumption_resumes_after_the_connection_drops() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, consumer) = setup(FailurePolicy::Drop, sender.clone()).await;
    let mut consumer = consumer.with_resubscribe_delay(Duration::from_millis(10));

    let publisher = EventPublisher::new(Arc::new(broker.clone()), ROUTING_KEY, Duration::from_secs(1));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let worker = tokio::spawn(async move {
        consumer
            .consume(QUEUE, ROUTING_KEY, async {
                let _ = stop_rx.await;
            })
            .await
    });

    publisher.publish_order_created(&order(1)).await;
    wait_for_acks(&broker, 1).await;

    broker.disconnect_consumers();
    publisher.publish_order_created(&order(2)).await;
    wait_for_acks(&broker, 2).await;

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(result.is_ok());

    assert_eq!(
        sender.subjects(),
        vec!["Order confirmation #1".to_string(), "Order confirmation #2".to_string()]
    );
}

#[tokio::test]
async fn consume_fails_when_the_broker_stays_down() {
    let sender = Arc::new(RecordingSender::default());
    let (broker, consumer) = setup(FailurePolicy::Drop, sender).await;
    let mut consumer = consumer.with_resubscribe_delay(Duration::from_millis(10));

    let outage = broker.clone();
    let worker = tokio::spawn(async move {
        consumer
            .consume(QUEUE, ROUTING_KEY, std::future::pending::<()>())
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    outage.set_available(false);
    outage.disconnect_consumers();

    let result = tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("consume kept retrying")
        .unwrap();
    assert!(result.is_err());
}
