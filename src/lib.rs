//! Library entrypoint for the order service.
//!
//! The binaries (`orderflow` HTTP service, `notification_worker` consumer)
//! and the integration tests under `tests/` build on these modules.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod models;

#[path = "middleware/auth.rs"]
pub mod auth;

pub mod services;

pub mod controllers;
pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub settings: config::Settings,
    pub orders: Arc<dyn services::order_store::OrderStore>,
    pub products: services::stock_validator::StockValidator,
    pub auth: services::auth_client::TokenVerifier,
    pub publisher: services::event_publisher::EventPublisher,
}
