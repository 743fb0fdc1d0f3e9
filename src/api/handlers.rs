use axum::{extract::{Path, Query, State}, http::StatusCode, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use super::{reject, AppState};
use crate::domain::aggregates::{Account, Category, Coupon, CustomField, DiscountType, Order, StockItem};
use crate::domain::value_objects::DeliveryMethod;
use crate::services::{CompletionReport, CouponValidation, NewCoupon, OrderDraft};
use crate::StorefrontError;

type ApiResult<T> = Result<T, (StatusCode, String)>;

fn check<T: Validate>(request: &T) -> ApiResult<()> {
    request.validate().map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
}

// =============================================================================
// Stock
// =============================================================================

#[derive(Debug, Serialize)] pub struct StockView { pub product_id: String, pub available: u64, pub items: Vec<StockItem> }

pub async fn get_stock(State(s): State<AppState>, Path(product_id): Path<String>) -> ApiResult<Json<StockView>> {
    let ledger = &s.storefront.stock;
    let available = ledger.available_count(&product_id).await.map_err(reject)?;
    let items = ledger.list(&product_id).await.map_err(reject)?;
    Ok(Json(StockView { product_id, available, items }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddCodesRequest {
    #[validate(length(min = 1, message = "at least one code is required"))]
    pub codes: Vec<String>,
}

#[derive(Debug, Serialize)] pub struct AddCodesResponse { pub added: Vec<StockItem>, pub available: u64 }

pub async fn add_stock(State(s): State<AppState>, Path(product_id): Path<String>, Json(r): Json<AddCodesRequest>) -> ApiResult<(StatusCode, Json<AddCodesResponse>)> {
    check(&r)?;
    let added = s.storefront.stock.add_codes(&product_id, &r.codes).await.map_err(reject)?;
    let available = s.storefront.stock.available_count(&product_id).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(AddCodesResponse { added, available })))
}

#[derive(Debug, Deserialize)] pub struct CorrectStockRequest { pub is_used: bool }

pub async fn correct_stock(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<CorrectStockRequest>) -> ApiResult<Json<StockItem>> {
    s.storefront.stock.correct(id, r.is_used).await.map(Json).map_err(reject)
}

// =============================================================================
// Coupons
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCouponRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    #[validate(range(min = 1))]
    pub usage_limit: u32,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub first_purchase_only: bool,
}

pub async fn create_coupon(State(s): State<AppState>, Json(r): Json<CreateCouponRequest>) -> ApiResult<(StatusCode, Json<Coupon>)> {
    check(&r)?;
    let new = NewCoupon {
        code: r.code, discount_type: r.discount_type, value: r.value, usage_limit: r.usage_limit,
        expires_at: r.expires_at, first_purchase_only: r.first_purchase_only,
    };
    let coupon = s.storefront.coupons.create(new).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(coupon)))
}

pub async fn get_coupon(State(s): State<AppState>, Path(code): Path<String>) -> ApiResult<Json<Coupon>> {
    s.storefront.coupons.get(&code).await.map_err(reject)?.map(Json).ok_or((StatusCode::NOT_FOUND, "Not found".to_string()))
}

#[derive(Debug, Deserialize)] pub struct CustomerParams { pub customer_id: String }

pub async fn validate_coupon(State(s): State<AppState>, Path(code): Path<String>, Query(p): Query<CustomerParams>) -> ApiResult<Json<CouponValidation>> {
    let prior_orders = s.storefront.orders.prior_orders(&p.customer_id).await.map_err(reject)?;
    s.storefront.coupons.validate(&code, prior_orders).await.map(Json).map_err(reject)
}

// =============================================================================
// Categories and accounts
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CategoryRequest {
    pub delivery_method: DeliveryMethod,
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,
}

pub async fn put_category(State(s): State<AppState>, Path(name): Path<String>, Json(r): Json<CategoryRequest>) -> ApiResult<Json<Category>> {
    let category = Category { name, delivery_method: r.delivery_method, custom_fields: r.custom_fields };
    s.storefront.categories.upsert(&category).await.map_err(reject)?;
    Ok(Json(category))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAccountRequest {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[serde(default)]
    pub wallet_balance: Decimal,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub loyalty_coins: i64,
}

pub async fn create_account(State(s): State<AppState>, Json(r): Json<CreateAccountRequest>) -> ApiResult<(StatusCode, Json<Account>)> {
    check(&r)?;
    if r.wallet_balance < Decimal::ZERO {
        return Err(reject(StorefrontError::InvalidInput("wallet balance must not be negative".into())));
    }
    let account = Account::open(r.id.trim()).with_wallet(r.wallet_balance).with_coins(r.loyalty_coins);
    s.storefront.accounts.create(&account).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(account)))
}

pub async fn get_account(State(s): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Account>> {
    s.storefront.accounts.account(&id).await.map(Json).map_err(reject)
}

// =============================================================================
// Loyalty
// =============================================================================

#[derive(Debug, Deserialize)] pub struct QuoteParams { pub customer_id: String, pub amount: Decimal }

#[derive(Debug, Serialize)]
pub struct LoyaltyQuote {
    pub customer_id: String,
    pub amount: Decimal,
    pub multiplier: Decimal,
    pub xp: Decimal,
    pub coins: i64,
    /// Coins the customer could spend against `amount` right now.
    pub max_redeemable_coins: i64,
    pub coin_value_usd: Decimal,
}

pub async fn loyalty_quote(State(s): State<AppState>, Query(p): Query<QuoteParams>) -> ApiResult<Json<LoyaltyQuote>> {
    if p.amount < Decimal::ZERO {
        return Err(reject(StorefrontError::InvalidInput("amount must not be negative".into())));
    }
    let loyalty = &s.storefront.loyalty;
    let account = s.storefront.accounts.account(&p.customer_id).await.map_err(reject)?;
    let multiplier = loyalty.multiplier_for(&account);
    let (xp, coins) = loyalty.accrual_for(p.amount, multiplier).map_err(reject)?;
    Ok(Json(LoyaltyQuote {
        xp,
        coins,
        max_redeemable_coins: loyalty.max_redeemable(&account, p.amount),
        coin_value_usd: loyalty.rates().coin_value_usd,
        customer_id: p.customer_id,
        amount: p.amount,
        multiplier,
    }))
}

// =============================================================================
// Orders
// =============================================================================

pub async fn place_order(State(s): State<AppState>, Json(draft): Json<OrderDraft>) -> ApiResult<(StatusCode, Json<Order>)> {
    let order = s.storefront.orders.place(draft).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn list_orders(State(s): State<AppState>, Query(p): Query<CustomerParams>) -> ApiResult<Json<Vec<Order>>> {
    s.storefront.orders.list_for_customer(&p.customer_id).await.map(Json).map_err(reject)
}

pub async fn get_order(State(s): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Order>> {
    s.storefront.orders.get(id).await.map(Json).map_err(reject)
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    /// Admin-entered content for manual-delivery lines, by line item id.
    #[serde(default)]
    pub manual_codes: HashMap<String, Vec<String>>,
}

pub async fn complete_order(State(s): State<AppState>, Path(id): Path<Uuid>, body: Option<Json<CompleteRequest>>) -> ApiResult<Json<CompletionReport>> {
    let Json(r) = body.unwrap_or_default();
    s.storefront.orders.complete(id, r.manual_codes).await.map(Json).map_err(reject)
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

pub async fn refund_order(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<RefundRequest>) -> ApiResult<Json<Order>> {
    check(&r)?;
    s.storefront.orders.refund(id, &r.reason).await.map(Json).map_err(reject)
}

#[derive(Debug, Deserialize)] pub struct DeliveryRequest { pub codes: Vec<String> }

pub async fn override_delivery(State(s): State<AppState>, Path((id, line_id)): Path<(Uuid, String)>, Json(r): Json<DeliveryRequest>) -> ApiResult<Json<Order>> {
    s.storefront.orders.override_delivery(id, &line_id, r.codes).await.map(Json).map_err(reject)
}
