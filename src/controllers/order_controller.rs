use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Extension, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::{
    errors::ApiError,
    models::{CurrentUser, OrderPatch, OrderStatus},
    services::order_service::{self, CreateOrder, DEFAULT_LIMIT},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub product_id: i64,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderRequest {
    #[serde(default)]
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

fn current_user(user: Option<Extension<CurrentUser>>) -> Result<CurrentUser, ApiError> {
    user.map(|Extension(u)| u).ok_or(ApiError::Unauthorized)
}

fn order_id(path: Result<Path<i64>, PathRejection>) -> Result<i64, ApiError> {
    path.map(|Path(id)| id)
        .map_err(|e| ApiError::Validation(e.body_text()))
}

// POST /orders
pub async fn post_order(
    State(state): State<AppState>,
    user: Option<Extension<CurrentUser>>,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Response {
    let u = match current_user(user) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return ApiError::Validation(e.body_text()).into_response(),
    };

    let req = CreateOrder {
        product_id: body.product_id,
        quantity: body.quantity,
    };

    match order_service::create_order(&state, u.id, req).await {
        Ok(order) => (StatusCode::CREATED, Json(order)).into_response(),
        Err(e) => {
            tracing::warn!(user_id = u.id, product_id = req.product_id, error = %e, "order rejected");
            e.into_response()
        }
    }
}

// GET /orders?skip=&limit=
pub async fn get_orders(
    State(state): State<AppState>,
    user: Option<Extension<CurrentUser>>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    let u = match current_user(user) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };

    let Query(params) = match params {
        Ok(p) => p,
        Err(e) => return ApiError::Validation(e.body_text()).into_response(),
    };

    let skip = params.skip.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);

    match order_service::list_orders(&state, u.id, skip, limit).await {
        Ok(orders) => (StatusCode::OK, Json(orders)).into_response(),
        Err(e) => e.into_response(),
    }
}

// GET /orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    user: Option<Extension<CurrentUser>>,
    path: Result<Path<i64>, PathRejection>,
) -> Response {
    let result = async {
        let u = current_user(user)?;
        let id = order_id(path)?;
        order_service::get_owned_order(&state, u.id, id).await
    }
    .await;

    match result {
        Ok(order) => (StatusCode::OK, Json(order)).into_response(),
        Err(e) => e.into_response(),
    }
}

// PUT /orders/:id (status only)
pub async fn put_order(
    State(state): State<AppState>,
    user: Option<Extension<CurrentUser>>,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<UpdateOrderRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let u = current_user(user)?;
        let id = order_id(path)?;
        let Json(body) = body.map_err(|e| ApiError::Validation(e.body_text()))?;

        order_service::update_order(&state, u.id, id, OrderPatch { status: body.status }).await
    }
    .await;

    match result {
        Ok(order) => (StatusCode::OK, Json(order)).into_response(),
        Err(e) => e.into_response(),
    }
}

// DELETE /orders/:id
pub async fn delete_order(
    State(state): State<AppState>,
    user: Option<Extension<CurrentUser>>,
    path: Result<Path<i64>, PathRejection>,
) -> Response {
    let result = async {
        let u = current_user(user)?;
        let id = order_id(path)?;
        order_service::delete_order(&state, u.id, id).await
    }
    .await;

    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
