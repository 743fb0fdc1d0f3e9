//! Collaborator interfaces the services are built against.
//!
//! Every port has an in-memory adapter (tests, single-node runs) and a
//! PostgreSQL adapter in [`crate::infrastructure`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::aggregates::{Account, BalanceAdjustment, Category, Coupon, Order, OrderStatus, StockItem};
use crate::domain::events::DomainEvent;
use crate::domain::value_objects::CouponCode;
use crate::Result;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Order>>;
    /// Newest first.
    async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Order>>;
    async fn count_for_customer(&self, customer_id: &str) -> Result<u64>;
    /// Writes `order` only if the stored status is still `expected`;
    /// otherwise fails with [`crate::StorefrontError::Conflict`].
    async fn update(&self, order: &Order, expected: OrderStatus) -> Result<()>;
}

#[async_trait]
pub trait StockStore: Send + Sync {
    async fn insert(&self, items: &[StockItem]) -> Result<()>;
    async fn available_count(&self, product_id: &str) -> Result<u64>;
    /// Marks up to `quantity` unused items as used, oldest first, and returns
    /// them in that order. No item is ever returned twice.
    async fn take_unused(&self, product_id: &str, quantity: u32, now: DateTime<Utc>) -> Result<Vec<StockItem>>;
    async fn list(&self, product_id: &str) -> Result<Vec<StockItem>>;
    async fn correct(&self, item_id: Uuid, is_used: bool, now: DateTime<Utc>) -> Result<StockItem>;
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    async fn insert(&self, coupon: &Coupon) -> Result<()>;
    async fn get(&self, code: &CouponCode) -> Result<Option<Coupon>>;
    /// Increments `times_used` unless the limit is already reached.
    async fn record_use(&self, code: &CouponCode) -> Result<Coupon>;
}

/// Balance and subscription mutators of the auth provider.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn create(&self, account: &Account) -> Result<()>;
    async fn account(&self, id: &str) -> Result<Account>;
    async fn update_wallet_balance(&self, id: &str, delta: Decimal) -> Result<BalanceAdjustment<Decimal>>;
    async fn update_total_spent(&self, id: &str, delta: Decimal) -> Result<BalanceAdjustment<Decimal>>;
    async fn update_loyalty_coins(&self, id: &str, delta: i64) -> Result<BalanceAdjustment<i64>>;
    /// Takes a non-negative `amount` from the wallet in one step, or nothing
    /// with [`crate::StorefrontError::InsufficientBalance`] when it is not all there.
    async fn debit_wallet(&self, id: &str, amount: Decimal) -> Result<BalanceAdjustment<Decimal>>;
    /// Takes `coins` in one step, or nothing with
    /// [`crate::StorefrontError::RedemptionRejected`].
    async fn spend_coins(&self, id: &str, coins: i64) -> Result<BalanceAdjustment<i64>>;
    /// Returns the new premium expiry.
    async fn subscribe_to_premium(&self, id: &str, months: u32) -> Result<DateTime<Utc>>;
}

#[async_trait]
pub trait CategoryCatalog: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Category>>;
    async fn upsert(&self, category: &Category) -> Result<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<()>;
}
