//! PostgreSQL adapters (sqlx). Schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::aggregates::{
    Account, BalanceAdjustment, Category, Coupon, CouponRejection, CustomField, Order, OrderStatus, StockItem,
};
use crate::domain::value_objects::CouponCode;
use crate::ports::{AccountDirectory, CategoryCatalog, CouponStore, EventPublisher, OrderStore, StockStore};
use crate::services::Backends;
use crate::{Result, StorefrontError};

pub fn postgres_backends(pool: PgPool, events: Arc<dyn EventPublisher>) -> Backends {
    Backends {
        orders: Arc::new(PgOrderStore { pool: pool.clone() }),
        stock: Arc::new(PgStockStore { pool: pool.clone() }),
        coupons: Arc::new(PgCouponStore { pool: pool.clone() }),
        accounts: Arc::new(PgAccountDirectory { pool: pool.clone() }),
        categories: Arc::new(PgCategoryCatalog { pool }),
        events,
    }
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StorefrontError {
    StorefrontError::Database(sqlx::Error::Decode(format!("corrupt {what} row: {detail}").into()))
}

// =============================================================================
// Orders
// =============================================================================

pub struct PgOrderStore { pool: PgPool }

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: &Order) -> Result<()> {
        sqlx::query("INSERT INTO orders (id, customer_id, status, document, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6)")
            .bind(order.id()).bind(order.customer_id()).bind(order.status().as_str()).bind(Json(order))
            .bind(order.created_at()).bind(order.updated_at())
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Order>> {
        let row: Option<(Json<Order>,)> = sqlx::query_as("SELECT document FROM orders WHERE id = $1")
            .bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|(Json(order),)| order))
    }

    async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Order>> {
        let rows: Vec<(Json<Order>,)> = sqlx::query_as("SELECT document FROM orders WHERE customer_id = $1 ORDER BY created_at DESC, id DESC")
            .bind(customer_id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(Json(order),)| order).collect())
    }

    async fn count_for_customer(&self, customer_id: &str) -> Result<u64> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE customer_id = $1")
            .bind(customer_id).fetch_one(&self.pool).await?;
        Ok(total.0.max(0) as u64)
    }

    async fn update(&self, order: &Order, expected: OrderStatus) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = $2, document = $3, updated_at = $4 WHERE id = $1 AND status = $5")
            .bind(order.id()).bind(order.status().as_str()).bind(Json(order)).bind(order.updated_at()).bind(expected.as_str())
            .execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorefrontError::Conflict(order.id().to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Stock
// =============================================================================

#[derive(sqlx::FromRow)]
struct StockRow {
    seq: i64,
    id: Uuid,
    product_id: String,
    code: String,
    is_used: bool,
    added_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
}

impl From<StockRow> for StockItem {
    fn from(r: StockRow) -> Self {
        Self { id: r.id, product_id: r.product_id, code: r.code, is_used: r.is_used, added_at: r.added_at, used_at: r.used_at }
    }
}

const STOCK_COLUMNS: &str = "seq, id, product_id, code, is_used, added_at, used_at";

pub struct PgStockStore { pool: PgPool }

#[async_trait]
impl StockStore for PgStockStore {
    async fn insert(&self, items: &[StockItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query("INSERT INTO stock_items (id, product_id, code, is_used, added_at, used_at) VALUES ($1, $2, $3, $4, $5, $6)")
                .bind(item.id).bind(&item.product_id).bind(&item.code).bind(item.is_used).bind(item.added_at).bind(item.used_at)
                .execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn available_count(&self, product_id: &str) -> Result<u64> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stock_items WHERE product_id = $1 AND NOT is_used")
            .bind(product_id).fetch_one(&self.pool).await?;
        Ok(total.0.max(0) as u64)
    }

    async fn take_unused(&self, product_id: &str, quantity: u32, now: DateTime<Utc>) -> Result<Vec<StockItem>> {
        let sql = format!(
            "UPDATE stock_items SET is_used = TRUE, used_at = $3 WHERE id IN (\
                SELECT id FROM stock_items WHERE product_id = $1 AND NOT is_used \
                ORDER BY seq LIMIT $2 FOR UPDATE SKIP LOCKED) \
             RETURNING {STOCK_COLUMNS}"
        );
        let mut rows = sqlx::query_as::<_, StockRow>(&sql)
            .bind(product_id).bind(i64::from(quantity)).bind(now)
            .fetch_all(&self.pool).await?;
        rows.sort_by_key(|r| r.seq);
        Ok(rows.into_iter().map(StockItem::from).collect())
    }

    async fn list(&self, product_id: &str) -> Result<Vec<StockItem>> {
        let sql = format!("SELECT {STOCK_COLUMNS} FROM stock_items WHERE product_id = $1 ORDER BY seq");
        let rows = sqlx::query_as::<_, StockRow>(&sql).bind(product_id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(StockItem::from).collect())
    }

    async fn correct(&self, item_id: Uuid, is_used: bool, now: DateTime<Utc>) -> Result<StockItem> {
        let sql = format!(
            "UPDATE stock_items SET is_used = $2, \
             used_at = CASE WHEN $2 THEN COALESCE(used_at, $3) ELSE NULL END \
             WHERE id = $1 RETURNING {STOCK_COLUMNS}"
        );
        sqlx::query_as::<_, StockRow>(&sql)
            .bind(item_id).bind(is_used).bind(now)
            .fetch_optional(&self.pool).await?
            .map(StockItem::from)
            .ok_or_else(|| StorefrontError::StockItemNotFound(item_id.to_string()))
    }
}

// =============================================================================
// Coupons
// =============================================================================

#[derive(sqlx::FromRow)]
struct CouponRow {
    code: String,
    discount_type: String,
    value: Decimal,
    usage_limit: i32,
    times_used: i32,
    expires_at: Option<DateTime<Utc>>,
    first_purchase_only: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<CouponRow> for Coupon {
    type Error = StorefrontError;
    fn try_from(r: CouponRow) -> Result<Self> {
        Ok(Self {
            code: CouponCode::new(r.code).map_err(|e| corrupt("coupon", e))?,
            discount_type: r.discount_type.parse().map_err(|e: String| corrupt("coupon", e))?,
            value: r.value,
            usage_limit: u32::try_from(r.usage_limit).map_err(|e| corrupt("coupon", e))?,
            times_used: u32::try_from(r.times_used).map_err(|e| corrupt("coupon", e))?,
            expires_at: r.expires_at,
            first_purchase_only: r.first_purchase_only,
            created_at: r.created_at,
        })
    }
}

pub struct PgCouponStore { pool: PgPool }

#[async_trait]
impl CouponStore for PgCouponStore {
    async fn insert(&self, coupon: &Coupon) -> Result<()> {
        let usage_limit = i32::try_from(coupon.usage_limit)
            .map_err(|_| StorefrontError::InvalidInput("usage limit too large".into()))?;
        let result = sqlx::query(
            "INSERT INTO coupons (code, discount_type, value, usage_limit, times_used, expires_at, first_purchase_only, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (code) DO NOTHING",
        )
        .bind(coupon.code.as_str()).bind(coupon.discount_type.as_str()).bind(coupon.value).bind(usage_limit)
        .bind(coupon.times_used as i32).bind(coupon.expires_at).bind(coupon.first_purchase_only).bind(coupon.created_at)
        .execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorefrontError::CouponExists(coupon.code.to_string()));
        }
        Ok(())
    }

    async fn get(&self, code: &CouponCode) -> Result<Option<Coupon>> {
        sqlx::query_as::<_, CouponRow>("SELECT * FROM coupons WHERE code = $1")
            .bind(code.as_str()).fetch_optional(&self.pool).await?
            .map(Coupon::try_from)
            .transpose()
    }

    async fn record_use(&self, code: &CouponCode) -> Result<Coupon> {
        let row = sqlx::query_as::<_, CouponRow>(
            "UPDATE coupons SET times_used = times_used + 1 WHERE code = $1 AND times_used < usage_limit RETURNING *",
        )
        .bind(code.as_str()).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Coupon::try_from(row),
            None if self.get(code).await?.is_some() => Err(CouponRejection::LimitReached.into()),
            None => Err(CouponRejection::NotFound.into()),
        }
    }
}

// =============================================================================
// Accounts
// =============================================================================

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: String,
    wallet_balance: Decimal,
    loyalty_coins: i64,
    total_spent: Decimal,
    premium_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(r: AccountRow) -> Self {
        Self {
            id: r.id, wallet_balance: r.wallet_balance, loyalty_coins: r.loyalty_coins, total_spent: r.total_spent,
            premium_until: r.premium_until, created_at: r.created_at, updated_at: r.updated_at,
        }
    }
}

pub struct PgAccountDirectory { pool: PgPool }

impl PgAccountDirectory {
    /// Applies `f` to the locked row and writes the result back in one
    /// transaction.
    async fn with_account<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Account) -> T + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(id).fetch_optional(&mut *tx).await?
            .ok_or_else(|| StorefrontError::AccountNotFound(id.to_string()))?;
        let mut account = Account::from(row);
        let out = f(&mut account);
        sqlx::query(
            "UPDATE accounts SET wallet_balance = $2, loyalty_coins = $3, total_spent = $4, premium_until = $5, updated_at = $6 WHERE id = $1",
        )
        .bind(&account.id).bind(account.wallet_balance).bind(account.loyalty_coins).bind(account.total_spent)
        .bind(account.premium_until).bind(account.updated_at)
        .execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(out)
    }
}

#[async_trait]
impl AccountDirectory for PgAccountDirectory {
    async fn create(&self, account: &Account) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO accounts (id, wallet_balance, loyalty_coins, total_spent, premium_until, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&account.id).bind(account.wallet_balance).bind(account.loyalty_coins).bind(account.total_spent)
        .bind(account.premium_until).bind(account.created_at).bind(account.updated_at)
        .execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StorefrontError::InvalidInput(format!("account {} already exists", account.id)));
        }
        Ok(())
    }

    async fn account(&self, id: &str) -> Result<Account> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = $1")
            .bind(id).fetch_optional(&self.pool).await?
            .map(Account::from)
            .ok_or_else(|| StorefrontError::AccountNotFound(id.to_string()))
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

// =============================================================================
// Categories
// =============================================================================

#[derive(sqlx::FromRow)]
struct CategoryRow {
    name: String,
    delivery_method: String,
    custom_fields: Json<Vec<CustomField>>,
}

pub struct PgCategoryCatalog { pool: PgPool }

#[async_trait]
impl CategoryCatalog for PgCategoryCatalog {
    async fn get(&self, name: &str) -> Result<Option<Category>> {
        let row = sqlx::query_as::<_, CategoryRow>("SELECT name, delivery_method, custom_fields FROM categories WHERE name = $1")
            .bind(name).fetch_optional(&self.pool).await?;
        row.map(|r| {
            Ok(Category {
                delivery_method: r.delivery_method.parse().map_err(|e: String| corrupt("category", e))?,
                name: r.name,
                custom_fields: r.custom_fields.0,
            })
        })
        .transpose()
    }

    async fn upsert(&self, category: &Category) -> Result<()> {
        sqlx::query(
            "INSERT INTO categories (name, delivery_method, custom_fields) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET delivery_method = EXCLUDED.delivery_method, custom_fields = EXCLUDED.custom_fields",
        )
        .bind(&category.name).bind(category.delivery_method.as_str()).bind(Json(&category.custom_fields))
        .execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{DiscountType, LineItem, RedemptionRejected};
    use crate::domain::value_objects::PaymentMethod;
    use std::collections::{BTreeMap, HashSet};

    // These run against a throwaway database created by `sqlx::test` from
    // DATABASE_URL: `cargo test -- --ignored`.

    fn order(customer: &str) -> Order {
        let item = LineItem {
            id: "1".into(), product_id: "p".into(), variant_id: None, name: "n".into(), category: "c".into(),
            quantity: 1, unit_price: Decimal::ONE, custom_fields: BTreeMap::new(),
        };
        Order::place(customer, vec![item], PaymentMethod::Wallet, None, None).unwrap()
    }

    #[sqlx::test]
    #[ignore = "needs a PostgreSQL DATABASE_URL"]
    async fn test_order_update_is_compare_and_set(pool: PgPool) {
        let store = PgOrderStore { pool };
        let mut o = order("alice");
        store.insert(&o).await.unwrap();
        o.refund("test").unwrap();

        let (a, b) = tokio::join!(store.update(&o, OrderStatus::Pending), store.update(&o, OrderStatus::Pending));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loaded = store.get(o.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), OrderStatus::Refunded);
        assert_eq!(loaded.total(), o.total());
        assert_eq!(store.list_for_customer("alice").await.unwrap().len(), 1);
    }

    #[sqlx::test]
    #[ignore = "needs a PostgreSQL DATABASE_URL"]
    async fn test_concurrent_takes_never_share_an_item(pool: PgPool) {
        let store = Arc::new(PgStockStore { pool });
        let items: Vec<StockItem> = (0..5).map(|i| StockItem::new("p", format!("CODE-{i}"))).collect();
        store.insert(&items).await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take_unused("p", 2, Utc::now()).await.unwrap() })
            })
            .collect();
        let mut taken = Vec::new();
        for handle in handles {
            taken.extend(handle.await.unwrap());
        }
        assert_eq!(taken.len(), 5);
        assert_eq!(taken.iter().map(|i| i.id).collect::<HashSet<_>>().len(), 5);
        assert_eq!(store.available_count("p").await.unwrap(), 0);

        let restored = store.correct(items[0].id, false, Utc::now()).await.unwrap();
        assert!(!restored.is_used && restored.used_at.is_none());
        let again = store.take_unused("p", 3, Utc::now()).await.unwrap();
        assert_eq!(again.iter().map(|i| i.id).collect::<Vec<_>>(), vec![restored.id]);
    }

    #[sqlx::test]
    #[ignore = "needs a PostgreSQL DATABASE_URL"]
    async fn test_coupon_uses_stop_at_the_limit(pool: PgPool) {
        let store = PgCouponStore { pool };
        let coupon = Coupon::create(CouponCode::new("TWICE").unwrap(), DiscountType::Fixed, Decimal::ONE, 2, None, false).unwrap();
        store.insert(&coupon).await.unwrap();
        assert!(matches!(store.insert(&coupon).await, Err(StorefrontError::CouponExists(_))));

        let (a, b, c) = tokio::join!(store.record_use(&coupon.code), store.record_use(&coupon.code), store.record_use(&coupon.code));
        assert_eq!([&a, &b, &c].iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(store.get(&coupon.code).await.unwrap().unwrap().times_used, 2);
        let missing = CouponCode::new("NOPE").unwrap();
        assert!(matches!(
            store.record_use(&missing).await,
            Err(StorefrontError::CouponRejected(CouponRejection::NotFound))
        ));
    }

    #[sqlx::test]
    #[ignore = "needs a PostgreSQL DATABASE_URL"]
    async fn test_concurrent_debits_never_overdraw(pool: PgPool) {
        let accounts = PgAccountDirectory { pool };
        accounts.create(&Account::open("u").with_wallet(Decimal::new(100, 0)).with_coins(50)).await.unwrap();

        let (a, b) = tokio::join!(
            accounts.debit_wallet("u", Decimal::new(60, 0)),
            accounts.debit_wallet("u", Decimal::new(60, 0)),
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            accounts.spend_coins("u", 51).await,
            Err(StorefrontError::RedemptionRejected(RedemptionRejected::InsufficientBalance { requested: 51, available: 50 }))
        ));
        let account = accounts.account("u").await.unwrap();
        assert_eq!(account.wallet_balance, Decimal::new(40, 0));
        assert_eq!(account.loyalty_coins, 50);
    }
}
