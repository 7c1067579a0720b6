use crate::{
    errors::ApiError,
    models::{NewOrder, Order, OrderPatch},
    AppState,
};

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct CreateOrder {
    pub product_id: i64,
    pub quantity: i64,
}

fn storage(e: String) -> ApiError {
    ApiError::Storage(e)
}

/// Validate stock, persist the snapshot, then publish `order.created`.
///
/// The stock read and the insert are not atomic: two requests for the same
/// product can both pass the check and together order more than is in stock.
/// Nothing here reserves or decrements stock on the product service.
///
/// Once the insert succeeds the order is returned whatever the publish
/// outcome.
pub async fn create_order(state: &AppState, user_id: i64, req: CreateOrder) -> Result<Order, ApiError> {
    if req.product_id <= 0 {
        return Err(ApiError::Validation("product_id must be greater than 0".into()));
    }
    if req.quantity <= 0 {
        return Err(ApiError::Validation("quantity must be greater than 0".into()));
    }

    let product = state.products.fetch(req.product_id).await?;

    if product.quantity < req.quantity {
        return Err(ApiError::InsufficientStock {
            available: product.quantity,
            requested: req.quantity,
        });
    }

    let new = NewOrder::pending(user_id, req.product_id, product.name, product.price, req.quantity);
    let order = state.orders.create(new).await.map_err(storage)?;

    tracing::info!(
        order_id = order.id,
        user_id,
        product_id = order.product_id,
        total_price = order.total_price,
        "order created"
    );

    state.publisher.publish_order_created(&order).await;

    Ok(order)
}

pub async fn list_orders(state: &AppState, user_id: i64, skip: u64, limit: i64) -> Result<Vec<Order>, ApiError> {
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::Validation(format!("limit must be between 1 and {MAX_LIMIT}")));
    }

    state
        .orders
        .list_by_user(user_id, skip, limit)
        .await
        .map_err(storage)
}

/// Load an order the caller owns: 404 if absent, 403 if someone else's.
pub async fn get_owned_order(state: &AppState, user_id: i64, order_id: i64) -> Result<Order, ApiError> {
    let order = state
        .orders
        .get_by_id(order_id)
        .await
        .map_err(storage)?
        .ok_or_else(|| ApiError::NotFound(format!("Order with ID {order_id} not found")))?;

    if order.user_id != user_id {
        return Err(ApiError::Forbidden("You do not have access to this order".into()));
    }

    Ok(order)
}

/// Status-only update. The write only lands if the row still has the status
/// the transition was checked against; a concurrent change turns into 409.
pub async fn update_order(
    state: &AppState,
    user_id: i64,
    order_id: i64,
    patch: OrderPatch,
) -> Result<Order, ApiError> {
    let current = get_owned_order(state, user_id, order_id).await?;

    let Some(next) = patch.status else {
        return Ok(current);
    };

    if !current.status.can_transition_to(next) {
        return Err(ApiError::InvalidTransition {
            from: current.status,
            to: next,
        });
    }

    match state
        .orders
        .update(order_id, current.status, patch)
        .await
        .map_err(storage)?
    {
        Some(updated) => {
            tracing::info!(order_id, status = %updated.status, "order updated");
            Ok(updated)
        }
        None => {
            let latest = state
                .orders
                .get_by_id(order_id)
                .await
                .map_err(storage)?
                .ok_or_else(|| ApiError::NotFound(format!("Order with ID {order_id} not found")))?;

            if latest.status == next {
                return Ok(latest);
            }

            tracing::warn!(
                order_id,
                expected = %current.status,
                found = %latest.status,
                "order status changed concurrently"
            );
            Err(ApiError::InvalidTransition {
                from: latest.status,
                to: next,
            })
        }
    }
}

pub async fn delete_order(state: &AppState, user_id: i64, order_id: i64) -> Result<(), ApiError> {
    get_owned_order(state, user_id, order_id).await?;

    if !state.orders.delete(order_id).await.map_err(storage)? {
        return Err(ApiError::NotFound(format!("Order with ID {order_id} not found")));
    }

    tracing::info!(order_id, "order deleted");
    Ok(())
}
