use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use super::order_store::OrderStore;
use crate::models::{NewOrder, Order, OrderPatch, OrderStatus};

const ORDERS: &str = "orders";
const COUNTERS: &str = "counters";

/// Stored shape of an order: same fields, integer id kept in `_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderDoc {
    #[serde(rename = "_id")]
    id: i64,
    user_id: i64,
    product_id: i64,
    product_name: String,
    quantity: i64,
    unit_price: f64,
    total_price: f64,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderDoc> for Order {
    fn from(d: OrderDoc) -> Self {
        Order {
            id: d.id,
            user_id: d.user_id,
            product_id: d.product_id,
            product_name: d.product_name,
            quantity: d.quantity,
            unit_price: d.unit_price,
            total_price: d.total_price,
            status: d.status,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

impl From<&Order> for OrderDoc {
    fn from(o: &Order) -> Self {
        OrderDoc {
            id: o.id,
            user_id: o.user_id,
            product_id: o.product_id,
            product_name: o.product_name.clone(),
            quantity: o.quantity,
            unit_price: o.unit_price,
            total_price: o.total_price,
            status: o.status,
            created_at: o.created_at,
            updated_at: o.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct MongoOrderStore {
    db: Database,
}

impl MongoOrderStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn orders(&self) -> Collection<OrderDoc> {
        self.db.collection::<OrderDoc>(ORDERS)
    }

    async fn next_id(&self) -> Result<i64, String> {
        let counters = self.db.collection::<Document>(COUNTERS);
        let opts = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let counter = counters
            .find_one_and_update(doc! { "_id": ORDERS }, doc! { "$inc": { "seq": 1_i64 } }, opts)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "order id counter missing after upsert".to_string())?;

        counter.get_i64("seq").map_err(|e| e.to_string())
    }
}

#[async_trait]
impl OrderStore for MongoOrderStore {
    async fn create(&self, new: NewOrder) -> Result<Order, String> {
        let id = self.next_id().await?;
        let order = new.into_order(id, Utc::now());

        self.orders()
            .insert_one(OrderDoc::from(&order), None)
            .await
            .map_err(|e| e.to_string())?;

        Ok(order)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Order>, String> {
        self.orders()
            .find_one(doc! { "_id": id }, None)
            .await
            .map(|d| d.map(Order::from))
            .map_err(|e| e.to_string())
    }

    async fn list_by_user(&self, user_id: i64, skip: u64, limit: i64) -> Result<Vec<Order>, String> {
        // _id comes from a monotonic counter, so it sorts the same as creation time
        let opts = FindOptions::builder()
            .sort(doc! { "_id": -1 })
            .skip(skip)
            .limit(limit)
            .build();

        let mut cursor = self
            .orders()
            .find(doc! { "user_id": user_id }, opts)
            .await
            .map_err(|e| e.to_string())?;

        let mut out = Vec::new();
        while let Some(item) = cursor.next().await {
            out.push(Order::from(item.map_err(|e| e.to_string())?));
        }
        Ok(out)
    }

    async fn update(&self, id: i64, expected: OrderStatus, patch: OrderPatch) -> Result<Option<Order>, String> {
        let now = Utc::now();

        let mut set = doc! { "updated_at": now.to_rfc3339() };
        if let Some(status) = patch.status {
            set.insert("status", status.as_str());
        }

        let opts = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        self.orders()
            .find_one_and_update(doc! { "_id": id, "status": expected.as_str() }, doc! { "$set": set }, opts)
            .await
            .map(|d| d.map(Order::from))
            .map_err(|e| e.to_string())
    }

    async fn delete(&self, id: i64) -> Result<bool, String> {
        let res = self
            .orders()
            .delete_one(doc! { "_id": id }, None)
            .await
            .map_err(|e| e.to_string())?;

        Ok(res.deleted_count > 0)
    }
}
