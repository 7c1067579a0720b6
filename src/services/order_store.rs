use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{NewOrder, Order, OrderPatch, OrderStatus};

/// Single-row persistence for orders. Every call is its own unit of work;
/// nothing here spans rows or services.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create(&self, new: NewOrder) -> Result<Order, String>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Order>, String>;

    /// Newest first.
    async fn list_by_user(&self, user_id: i64, skip: u64, limit: i64) -> Result<Vec<Order>, String>;

    /// Applies `patch` only if the row is still in `expected` status.
    /// `None` when the row is gone or its status has moved on.
    async fn update(&self, id: i64, expected: OrderStatus, patch: OrderPatch) -> Result<Option<Order>, String>;

    async fn delete(&self, id: i64) -> Result<bool, String>;
}

struct Rows {
    next_id: i64,
    by_id: BTreeMap<i64, Order>,
}

pub struct InMemoryOrderStore {
    rows: RwLock<Rows>,
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Rows {
                next_id: 1,
                by_id: BTreeMap::new(),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, new: NewOrder) -> Result<Order, String> {
        let mut rows = self.rows.write().await;

        let id = rows.next_id;
        rows.next_id += 1;

        let order = new.into_order(id, Utc::now());
        rows.by_id.insert(id, order.clone());
        Ok(order)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Order>, String> {
        Ok(self.rows.read().await.by_id.get(&id).cloned())
    }

    async fn list_by_user(&self, user_id: i64, skip: u64, limit: i64) -> Result<Vec<Order>, String> {
        let rows = self.rows.read().await;

        // ids are handed out in insertion order, so descending id is newest first
        Ok(rows
            .by_id
            .values()
            .rev()
            .filter(|o| o.user_id == user_id)
            .skip(skip as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update(&self, id: i64, expected: OrderStatus, patch: OrderPatch) -> Result<Option<Order>, String> {
        let mut rows = self.rows.write().await;

        let Some(order) = rows.by_id.get_mut(&id) else {
            return Ok(None);
        };
        if order.status != expected {
            return Ok(None);
        }

        patch.apply(order, Utc::now());
        Ok(Some(order.clone()))
    }

    async fn delete(&self, id: i64) -> Result<bool, String> {
        Ok(self.rows.write().await.by_id.remove(&id).is_some())
    }
}
