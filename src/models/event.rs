//! Wire format of the events carried by the broker.
//!
//! Every message body is a JSON object:
//!
//! ```json
//! {"event": "order.created", "version": 1, "id": "<uuid>", "data": {...}}
//! ```
//!
//! `version` and `id` may be missing on messages produced by older publishers;
//! a missing version reads as 1 and a missing id disables duplicate detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::Order;

pub const ORDER_CREATED: &str = "order.created";
pub const ORDER_CREATED_VERSION: u32 = 1;

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub event: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    #[serde(default)]
    pub data: Value,
}

/// Order fields as they were when the event was produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub total_price: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderSnapshot {
    fn from(o: &Order) -> Self {
        Self {
            order_id: o.id,
            user_id: o.user_id,
            product_id: o.product_id,
            product_name: o.product_name.clone(),
            quantity: o.quantity,
            unit_price: o.unit_price,
            total_price: o.total_price,
            status: o.status.as_str().to_string(),
            created_at: o.created_at,
        }
    }
}

/// Decoded, typed form of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Created(OrderSnapshot),
    /// An event name this build does not know. Kept so newer producers
    /// can add events without breaking older consumers.
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is not a valid envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported version {version} for event '{event}'")]
    UnsupportedVersion { event: String, version: u32 },

    #[error("invalid payload for '{event}': {reason}")]
    InvalidPayload { event: String, reason: String },
}

impl EventEnvelope {
    pub fn order_created(order: &Order) -> Self {
        let data = serde_json::to_value(OrderSnapshot::from(order)).unwrap_or(Value::Null);

        Self {
            event: ORDER_CREATED.to_string(),
            version: ORDER_CREATED_VERSION,
            id: Some(Uuid::new_v4()),
            data,
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(&self) -> Result<OrderEvent, DecodeError> {
        match self.event.as_str() {
            ORDER_CREATED => {
                if self.version != ORDER_CREATED_VERSION {
                    return Err(DecodeError::UnsupportedVersion {
                        event: self.event.clone(),
                        version: self.version,
                    });
                }

                serde_json::from_value::<OrderSnapshot>(self.data.clone())
                    .map(OrderEvent::Created)
                    .map_err(|e| DecodeError::InvalidPayload {
                        event: self.event.clone(),
                        reason: e.to_string(),
                    })
            }
            other => Ok(OrderEvent::Unknown(other.to_string())),
        }
    }
}
