use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::ApiError;

/// Read-only client for the product service. One request per call, no cache,
/// no retry: a timeout or transport failure is returned to the caller.
#[derive(Clone)]
pub struct StockValidator {
    http: Client,
    base_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProductSnapshot {
    pub name: String,
    pub price: f64,
    pub quantity: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum StockError {
    #[error("product {0} not found")]
    NotFound(i64),

    #[error("product service unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl From<StockError> for ApiError {
    fn from(e: StockError) -> Self {
        match e {
            StockError::NotFound(id) => ApiError::NotFound(format!("Product with ID {id} not found")),
            StockError::UpstreamUnavailable(msg) => ApiError::UpstreamUnavailable(msg),
        }
    }
}

impl StockValidator {
    /// Fails if the HTTP client cannot be built; a client without the
    /// timeout is never substituted.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn fetch(&self, product_id: i64) -> Result<ProductSnapshot, StockError> {
        let url = format!("{}/products/{}", self.base_url, product_id);

        let res = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                tracing::error!(product_id, "product service timeout");
                StockError::UpstreamUnavailable("Product service did not respond in time".to_string())
            } else {
                tracing::error!(product_id, error = %e, "product service connection error");
                StockError::UpstreamUnavailable(format!("Could not reach product service: {e}"))
            }
        })?;

        match res.status() {
            StatusCode::OK => res.json::<ProductSnapshot>().await.map_err(|e| {
                tracing::error!(product_id, error = %e, "product service sent an unreadable body");
                StockError::UpstreamUnavailable(format!("Invalid product response: {e}"))
            }),
            StatusCode::NOT_FOUND => Err(StockError::NotFound(product_id)),
            status => {
                let body = res.text().await.unwrap_or_default();
                tracing::error!(product_id, %status, "product service returned an unexpected status");
                Err(StockError::UpstreamUnavailable(format!(
                    "Product service returned {status} {body}"
                )))
            }
        }
    }
}
