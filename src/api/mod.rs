//! JSON HTTP surface.

mod handlers;

use axum::{http::StatusCode, routing::{get, patch, post, put}, Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::services::Storefront;
use crate::StorefrontError;

#[derive(Clone)] pub struct AppState { pub storefront: Storefront }

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "valhalla-storefront"})) }))
        .route("/api/v1/stock/items/:id", patch(handlers::correct_stock))
        .route("/api/v1/stock/:product_id", get(handlers::get_stock).post(handlers::add_stock))
        .route("/api/v1/coupons", post(handlers::create_coupon))
        .route("/api/v1/coupons/:code", get(handlers::get_coupon))
        .route("/api/v1/coupons/:code/validate", get(handlers::validate_coupon))
        .route("/api/v1/categories/:name", put(handlers::put_category))
        .route("/api/v1/accounts", post(handlers::create_account))
        .route("/api/v1/accounts/:id", get(handlers::get_account))
        .route("/api/v1/loyalty/quote", get(handlers::loyalty_quote))
        .route("/api/v1/orders", get(handlers::list_orders).post(handlers::place_order))
        .route("/api/v1/orders/:id", get(handlers::get_order))
        .route("/api/v1/orders/:id/complete", post(handlers::complete_order))
        .route("/api/v1/orders/:id/refund", post(handlers::refund_order))
        .route("/api/v1/orders/:id/delivered/:line_id", put(handlers::override_delivery))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state)
}

/// Maps a service error onto the status code and message returned to the
/// client. Storage failures are logged and reported without detail.
pub(crate) fn reject(e: StorefrontError) -> (StatusCode, String) {
    use StorefrontError::*;
    let status = match &e {
        OrderNotFound(_) | AccountNotFound(_) | StockItemNotFound(_) | LineItemNotFound(_) => StatusCode::NOT_FOUND,
        CouponRejected(_) | RedemptionRejected(_) | InsufficientBalance { .. } | InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        InvalidTransition { .. } | OrderNotCompleted(_) | Conflict(_) | CouponExists(_) => StatusCode::CONFLICT,
        Database(_) | Serialization(_) | Events(_) => {
            error!(error = %e, "request failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string());
        }
    };
    (status, e.to_string())
}
