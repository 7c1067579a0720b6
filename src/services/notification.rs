use std::sync::Arc;

use async_trait::async_trait;

use crate::models::OrderSnapshot;

/// Transport for a finished notification (email, SMS, push...).
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), String>;
}

/// Writes the notification to the log instead of delivering it.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), String> {
        tracing::info!(recipient, subject, "sending order confirmation\n{body}");
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: Arc<dyn NotificationSender>,
}

pub fn recipient_for(user_id: i64) -> String {
    format!("user:{user_id}")
}

pub fn confirmation_subject(order: &OrderSnapshot) -> String {
    format!("Order confirmation #{}", order.order_id)
}

pub fn confirmation_body(order: &OrderSnapshot) -> String {
    format!(
        "Dear Customer,\n\n\
         Your order #{} has been created.\n\n\
         Order details:\n  \
         - Product: {}\n  \
         - Quantity: {}\n  \
         - Unit price: {:.2}\n  \
         - Total: {:.2}\n\n\
         Thank you for your order!",
        order.order_id, order.product_name, order.quantity, order.unit_price, order.total_price
    )
}

impl NotificationDispatcher {
    pub fn new(sender: Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }

    /// One send attempt; the error is returned for logging only.
    pub async fn notify(&self, order: &OrderSnapshot) -> Result<(), String> {
        let recipient = recipient_for(order.user_id);
        let subject = confirmation_subject(order);
        let body = confirmation_body(order);

        self.sender.send(&recipient, &subject, &body).await
    }
}
