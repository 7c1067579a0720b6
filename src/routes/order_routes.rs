use axum::{Router, routing::get};

use crate::{AppState, controllers::order_controller};

pub fn add_routes(router: Router<AppState>) -> Router<AppState> {
    router
        .route(
            "/orders",
            get(order_controller::get_orders).post(order_controller::post_order),
        )
        .route(
            "/orders/:id",
            get(order_controller::get_order)
                .put(order_controller::put_order)
                .delete(order_controller::delete_order),
        )
}
