//! In-memory adapters. Used by the test suite and by the server when no
//! database is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::aggregates::{Account, BalanceAdjustment, Category, Coupon, CouponRejection, Order, OrderStatus, StockItem};
use crate::domain::events::DomainEvent;
use crate::domain::value_objects::CouponCode;
use crate::ports::{AccountDirectory, CategoryCatalog, CouponStore, EventPublisher, OrderStore, StockStore};
use crate::services::Backends;
use crate::{Result, StorefrontError};

pub fn in_memory_backends(events: Arc<dyn EventPublisher>) -> Backends {
    Backends {
        orders: Arc::new(MemoryOrderStore::default()),
        stock: Arc::new(MemoryStockStore::default()),
        coupons: Arc::new(MemoryCouponStore::default()),
        accounts: Arc::new(MemoryAccountDirectory::default()),
        categories: Arc::new(MemoryCategoryCatalog::default()),
        events,
    }
}

#[derive(Default)]
pub struct MemoryOrderStore { orders: Mutex<HashMap<Uuid, Order>> }

impl MemoryOrderStore {
    fn detached(order: &Order) -> Order {
        let mut stored = order.clone();
        stored.take_events();
        stored
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<()> {
        self.orders.lock().await.insert(order.id(), Self::detached(order));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.orders.lock().await.get(&id).cloned())
    }

    async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self.orders.lock().await
            .values()
            .filter(|o| o.customer_id() == customer_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then(b.id().cmp(&a.id())));
        Ok(orders)
    }

    async fn count_for_customer(&self, customer_id: &str) -> Result<u64> {
        Ok(self.orders.lock().await.values().filter(|o| o.customer_id() == customer_id).count() as u64)
    }

    async fn update(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        let mut orders = self.orders.lock().await;
        match orders.get(&order.id()) {
            Some(current) if current.status() == expected => {
                orders.insert(order.id(), Self::detached(order));
                Ok(())
            }
            _ => Err(StorefrontError::Conflict(order.id().to_string())),
        }
    }
}

/// Items are kept in insertion order, which is also allocation order.
#[derive(Default)]
pub struct MemoryStockStore { items: Mutex<Vec<StockItem>> }

#[async_trait]
impl StockStore for MemoryStockStore {
    async fn insert(&self, items: &[StockItem]) -> Result<()> {
        self.items.lock().await.extend_from_slice(items);
        Ok(())
    }

    async fn available_count(&self, product_id: &str) -> Result<u64> {
        Ok(self.items.lock().await.iter().filter(|i| i.product_id == product_id && !i.is_used).count() as u64)
    }

    async fn take_unused(&self, product_id: &str, quantity: u32, now: DateTime<Utc>) -> Result<Vec<StockItem>> {
        let mut items = self.items.lock().await;
        let taken = items
            .iter_mut()
            .filter(|i| i.product_id == product_id && !i.is_used)
            .take(quantity as usize)
            .map(|item| {
                item.mark_used(now);
                item.clone()
            })
            .collect();
        Ok(taken)
    }

    async fn list(&self, product_id: &str) -> Result<Vec<StockItem>> {
        Ok(self.items.lock().await.iter().filter(|i| i.product_id == product_id).cloned().collect())
    }

    async fn correct(&self, item_id: Uuid, is_used: bool, now: DateTime<Utc>) -> Result<StockItem> {
        let mut items = self.items.lock().await;
        let item = items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| StorefrontError::StockItemNotFound(item_id.to_string()))?;
        item.correct(is_used, now);
        Ok(item.clone())
    }
}

#[derive(Default)]
pub struct MemoryCouponStore { coupons: Mutex<HashMap<CouponCode, Coupon>> }

#[async_trait]
impl CouponStore for MemoryCouponStore {
    async fn insert(&self, coupon: &Coupon) -> Result<()> {
        let mut coupons = self.coupons.lock().await;
        if coupons.contains_key(&coupon.code) {
            return Err(StorefrontError::CouponExists(coupon.code.to_string()));
        }
        coupons.insert(coupon.code.clone(), coupon.clone());
        Ok(())
    }

    async fn get(&self, code: &CouponCode) -> Result<Option<Coupon>> {
        Ok(self.coupons.lock().await.get(code).cloned())
    }

    async fn record_use(&self, code: &CouponCode) -> Result<Coupon> {
        let mut coupons = self.coupons.lock().await;
        let coupon = coupons.get_mut(code).ok_or(StorefrontError::CouponRejected(CouponRejection::NotFound))?;
        coupon.record_use()?;
        Ok(coupon.clone())
    }
}

#[derive(Default)]
pub struct MemoryAccountDirectory { accounts: Mutex<HashMap<String, Account>> }

impl MemoryAccountDirectory {
    async fn with_account<T>(&self, id: &str, f: impl FnOnce(&mut Account) -> T) -> Result<T> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.get_mut(id).ok_or_else(|| StorefrontError::AccountNotFound(id.to_string()))?;
        Ok(f(account))
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccountDirectory {
    async fn create(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(&account.id) {
            return Err(StorefrontError::InvalidInput(format!("account {} already exists", account.id)));
        }
        accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn account(&self, id: &str) -> Result<Account> {
        self.with_account(id, |a| a.clone()).await
    }

    async fn update_wallet_balance(&self, id: &str, delta: Decimal) -> Result<BalanceAdjustment<Decimal>> {
        self.with_account(id, |a| a.adjust_wallet(delta)).await
    }

    async fn update_total_spent(&self, id: &str, delta: Decimal) -> Result<BalanceAdjustment<Decimal>> {
        self.with_account(id, |a| a.adjust_total_spent(delta)).await
    }

    async fn update_loyalty_coins(&self, id: &str, delta: i64) -> Result<BalanceAdjustment<i64>> {
        self.with_account(id, |a| a.adjust_coins(delta)).await
    }

    async fn debit_wallet(&self, id: &str, amount: Decimal) -> Result<BalanceAdjustment<Decimal>> {
        Ok(self.with_account(id, |a| a.debit_wallet(amount)).await??)
    }

    async fn spend_coins(&self, id: &str, coins: i64) -> Result<BalanceAdjustment<i64>> {
        Ok(self.with_account(id, |a| a.spend_coins(coins)).await??)
    }

    async fn subscribe_to_premium(&self, id: &str, months: u32) -> Result<DateTime<Utc>> {
        self.with_account(id, |a| a.extend_premium(months, Utc::now())).await
    }
}

#[derive(Default)]
pub struct MemoryCategoryCatalog { categories: Mutex<HashMap<String, Category>> }

#[async_trait]
impl CategoryCatalog for MemoryCategoryCatalog {
    async fn get(&self, name: &str) -> Result<Option<Category>> {
        Ok(self.categories.lock().await.get(name).cloned())
    }

    async fn upsert(&self, category: &Category) -> Result<()> {
        self.categories.lock().await.insert(category.name.clone(), category.clone());
        Ok(())
    }
}

/// Keeps every published event; lets tests assert on what was raised.
#[derive(Default)]
pub struct RecordingPublisher { events: Mutex<Vec<DomainEvent>> }

impl RecordingPublisher {
    pub async fn events(&self) -> Vec<DomainEvent> { self.events.lock().await.clone() }
    pub async fn subjects(&self) -> Vec<String> { self.events.lock().await.iter().map(DomainEvent::subject).collect() }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
