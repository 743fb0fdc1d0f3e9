//! Order lifecycle: pending -> completed / refunded.
//!
//! Placement takes payment up front: redeemed coins and wallet funds leave
//! the customer's balances as soon as the order exists. Completion delivers
//! goods (stock codes or admin-supplied text), activates premium and accrues
//! loyalty. A refund returns money and coins and claws back the accrual, but
//! never reclaims delivered codes or coupon uses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::aggregates::{AccrualRecord, AppliedDiscount, AppliedLoyalty, LineItem, Order, OrderError, OrderStatus};
use crate::domain::value_objects::{DeliveryMethod, PaymentMethod};
use crate::ports::{AccountDirectory, CategoryCatalog, EventPublisher, OrderStore};
use crate::services::{publish_all, Backends, CouponRegistry, CouponValidation, LoyaltyAccrual, StockLedger};
use crate::{Result, StorefrontError};

/// Which premium multiplier a refund uses to claw back XP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefundMultiplierPolicy {
    /// The customer's premium status at refund time.
    #[default]
    Current,
    /// The multiplier stored on the order when it completed.
    Recorded,
}

impl FromStr for RefundMultiplierPolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(Self::Current),
            "recorded" => Ok(Self::Recorded),
            other => Err(format!("unknown refund multiplier policy: {other}")),
        }
    }
}

impl fmt::Display for RefundMultiplierPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Self::Current => "current", Self::Recorded => "recorded" })
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    /// Product whose purchase grants premium, one month per unit.
    pub premium_product_id: String,
    pub refund_multiplier: RefundMultiplierPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self { premium_product_id: "valhalla-premium".into(), refund_multiplier: RefundMultiplierPolicy::default() }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OrderDraft {
    pub customer_id: String,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub loyalty_coins: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryShortfall {
    pub line_item_id: String,
    pub product_id: String,
    pub requested: u32,
    pub delivered: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompletionReport {
    pub order: Order,
    /// Instant lines that received fewer codes than ordered.
    pub shortfalls: Vec<DeliveryShortfall>,
    pub premium_until: Option<DateTime<Utc>>,
}

pub struct OrderLifecycle {
    orders: Arc<dyn OrderStore>,
    accounts: Arc<dyn AccountDirectory>,
    categories: Arc<dyn CategoryCatalog>,
    events: Arc<dyn EventPublisher>,
    stock: Arc<StockLedger>,
    loyalty: Arc<LoyaltyAccrual>,
    coupons: Arc<CouponRegistry>,
    settings: LifecycleSettings,
    // Serializes complete/refund/override within this process. Across
    // processes the status write in `OrderStore::update` is the claim.
    transitions: Mutex<()>,
}

/// Balances taken from the customer while an order is being placed.
#[derive(Default)]
struct Held { coins: i64, wallet: Decimal }

struct Fulfilment {
    delivered: BTreeMap<String, Vec<String>>,
    shortfalls: Vec<DeliveryShortfall>,
    premium_until: Option<DateTime<Utc>>,
    accrual: Option<AccrualRecord>,
}

impl OrderLifecycle {
    pub fn new(
        backends: &Backends, stock: Arc<StockLedger>, loyalty: Arc<LoyaltyAccrual>, coupons: Arc<CouponRegistry>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            orders: backends.orders.clone(),
            accounts: backends.accounts.clone(),
            categories: backends.categories.clone(),
            events: backends.events.clone(),
            stock, loyalty, coupons, settings,
            transitions: Mutex::new(()),
        }
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order> {
        self.orders.get(order_id).await?.ok_or_else(|| StorefrontError::OrderNotFound(order_id.to_string()))
    }

    pub async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Order>> {
        self.orders.list_for_customer(customer_id).await
    }

    /// Orders the customer has placed so far, whatever their status.
    pub async fn prior_orders(&self, customer_id: &str) -> Result<u64> {
        self.orders.count_for_customer(customer_id).await
    }

    /// Creates a pending order. All checks run before any balance moves, and
    /// a placement that fails part way gives back what it already took.
    pub async fn place(&self, draft: OrderDraft) -> Result<Order> {
        let subtotal = Order::subtotal_of(&draft.items)?;
        self.check_custom_fields(&draft.items).await?;
        let account = self.accounts.account(&draft.customer_id).await?;

        let discount = match draft.coupon_code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => {
                let prior_orders = self.prior_orders(&draft.customer_id).await?;
                match self.coupons.validate(code, prior_orders).await? {
                    CouponValidation::Valid(coupon) => Some(AppliedDiscount {
                        amount: CouponRegistry::compute_discount(&coupon, subtotal).min(subtotal),
                        code: coupon.code,
                    }),
                    CouponValidation::Invalid(rejection) => return Err(rejection.into()),
                }
            }
            None => None,
        };
        let redeemable_against = subtotal - discount.as_ref().map_or(Decimal::ZERO, |d| d.amount);

        let loyalty = if draft.loyalty_coins != 0 {
            let redemption = self.loyalty.check_redemption(&account, draft.loyalty_coins, redeemable_against)?;
            Some(AppliedLoyalty { coins: redemption.coins, value_usd: redemption.value_usd })
        } else {
            None
        };

        let mut order = Order::place(&draft.customer_id, draft.items, draft.payment_method, discount, loyalty)?;
        self.premium_months(order.items())?;
        let top_multiplier = self.loyalty.rates().premium_multiplier.max(Decimal::ONE);
        self.loyalty.accrual_for(order.cash_spent(), top_multiplier)?;
        if self.wallet_debit(&order) > account.wallet_balance {
            return Err(StorefrontError::InsufficientBalance { needed: order.total(), available: account.wallet_balance });
        }

        let mut held = Held::default();
        if let Err(e) = self.commit(&order, redeemable_against, &mut held).await {
            self.release(order.customer_id(), &held).await;
            return Err(e);
        }

        info!(
            order_id = %order.id(), customer_id = order.customer_id(), subtotal = %order.subtotal(),
            total = %order.total(), payment_method = %order.payment_method(), "order placed"
        );
        publish_all(self.events.as_ref(), order.take_events()).await;
        Ok(order)
    }

    /// Takes coins, then wallet funds, then the coupon use, then stores the
    /// order. Debits are conditional, so a balance spent by a concurrent
    /// order fails here instead of going negative.
    async fn commit(&self, order: &Order, redeemable_against: Decimal, held: &mut Held) -> Result<()> {
        if let Some(applied) = order.loyalty() {
            self.loyalty.redeem(order.customer_id(), applied.coins, redeemable_against).await?;
            held.coins = applied.coins;
        }
        let debit = self.wallet_debit(order);
        if debit > Decimal::ZERO {
            self.accounts.debit_wallet(order.customer_id(), debit).await?;
            held.wallet = debit;
        }
        if let Some(discount) = order.discount() {
            self.coupons.mark_used(discount.code.as_str()).await?;
        }
        if let Err(e) = self.orders.insert(order).await {
            if let Some(discount) = order.discount() {
                error!(order_id = %order.id(), code = %discount.code, "order not stored, coupon use is not returned");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn release(&self, customer_id: &str, held: &Held) {
        if held.coins > 0 {
            if let Err(e) = self.loyalty.restore(customer_id, held.coins).await {
                error!(customer_id, coins = held.coins, error = %e, "failed to give back coins of an abandoned order");
            }
        }
        if held.wallet > Decimal::ZERO {
            match self.accounts.update_wallet_balance(customer_id, held.wallet).await {
                Ok(_) => info!(customer_id, amount = %held.wallet, "wallet debit of an abandoned order returned"),
                Err(e) => error!(customer_id, amount = %held.wallet, error = %e, "failed to return wallet debit of an abandoned order"),
            }
        }
    }

    fn wallet_debit(&self, order: &Order) -> Decimal {
        if order.payment_method() == PaymentMethod::Wallet { order.total() } else { Decimal::ZERO }
    }

    /// Premium months bought on the order, one per unit of the premium product.
    fn premium_months(&self, items: &[LineItem]) -> Result<u32> {
        items
            .iter()
            .filter(|i| i.product_id == self.settings.premium_product_id)
            .try_fold(0u32, |months, i| months.checked_add(i.quantity))
            .ok_or_else(|| StorefrontError::InvalidInput("too many premium months on one order".into()))
    }

    /// Delivers the order. `manual_overrides` maps line item ids to the
    /// content an admin typed for manual-delivery lines.
    ///
    /// The status change is written first; only the caller whose write lands
    /// allocates stock and credits the customer.
    pub async fn complete(&self, order_id: Uuid, manual_overrides: HashMap<String, Vec<String>>) -> Result<CompletionReport> {
        let _guard = self.transitions.lock().await;
        let mut order = self.get(order_id).await?;
        if !order.begin_completion()? {
            debug!(%order_id, "order already completed");
            return Ok(CompletionReport { order, shortfalls: vec![], premium_until: None });
        }
        let premium_months = self.premium_months(order.items())?;
        self.orders.update(&order, OrderStatus::Pending).await?;

        let fulfilment = match self.fulfil(&order, &manual_overrides, premium_months).await {
            Ok(fulfilment) => fulfilment,
            Err(e) => {
                error!(%order_id, error = %e, "order marked completed but fulfilment failed");
                return Err(e);
            }
        };
        let Fulfilment { delivered, shortfalls, premium_until, accrual } = fulfilment;
        order.record_fulfilment(delivered, accrual, shortfalls.len())?;
        if let Err(e) = self.orders.update(&order, OrderStatus::Completed).await {
            error!(%order_id, error = %e, "order fulfilled but its delivery record was not saved");
            return Err(e);
        }

        let customer_id = order.customer_id();
        if shortfalls.is_empty() {
            info!(%order_id, customer_id, "order completed");
        } else {
            warn!(%order_id, customer_id, short_lines = shortfalls.len(), "order completed with partial delivery");
        }
        publish_all(self.events.as_ref(), order.take_events()).await;
        Ok(CompletionReport { order, shortfalls, premium_until })
    }

    async fn fulfil(&self, order: &Order, manual_overrides: &HashMap<String, Vec<String>>, premium_months: u32) -> Result<Fulfilment> {
        let order_id = order.id();
        let customer_id = order.customer_id();

        let mut delivered: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut shortfalls = Vec::new();
        for item in order.items() {
            match self.delivery_method(&item.category).await? {
                DeliveryMethod::Instant => {
                    let allocation = self.stock.allocate(&item.product_id, item.quantity).await?;
                    if allocation.is_short() {
                        shortfalls.push(DeliveryShortfall {
                            line_item_id: item.id.clone(), product_id: item.product_id.clone(),
                            requested: allocation.requested, delivered: allocation.delivered(),
                        });
                    }
                    if !allocation.codes.is_empty() {
                        delivered.insert(item.id.clone(), allocation.codes);
                    }
                }
                DeliveryMethod::Manual => {
                    let content: Vec<String> = manual_overrides
                        .get(&item.id)
                        .into_iter()
                        .flatten()
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect();
                    if !content.is_empty() {
                        delivered.insert(item.id.clone(), content);
                    }
                }
            }
        }

        let premium_until = if premium_months > 0 {
            let until = self.accounts.subscribe_to_premium(customer_id, premium_months).await?;
            info!(%order_id, customer_id, months = premium_months, %until, "premium activated");
            Some(until)
        } else {
            None
        };

        let multiplier = self.loyalty.current_multiplier(customer_id).await?;
        let accrual = self.loyalty.accrue(customer_id, order.cash_spent(), multiplier).await?;
        Ok(Fulfilment { delivered, shortfalls, premium_until, accrual })
    }

    /// Refunds the order. As with completion, the status change is written
    /// before any money or coins move, so a lost race returns nothing twice.
    pub async fn refund(&self, order_id: Uuid, reason: &str) -> Result<Order> {
        let _guard = self.transitions.lock().await;
        let mut order = self.get(order_id).await?;
        let previous = order.status();
        if !order.can_transition(OrderStatus::Refunded)? {
            debug!(%order_id, "order already refunded");
            return Ok(order);
        }
        order.refund(reason)?;
        self.orders.update(&order, previous).await?;

        if let Err(e) = self.return_payment(&order, previous).await {
            error!(%order_id, error = %e, "order marked refunded but returning payment failed");
            return Err(e);
        }
        info!(%order_id, customer_id = order.customer_id(), from = %previous, reason, "order refunded");
        publish_all(self.events.as_ref(), order.take_events()).await;
        Ok(order)
    }

    async fn return_payment(&self, order: &Order, previous: OrderStatus) -> Result<()> {
        let customer_id = order.customer_id();
        let paid = self.wallet_debit(order);
        if paid > Decimal::ZERO {
            self.accounts.update_wallet_balance(customer_id, paid).await?;
        }
        if let Some(applied) = order.loyalty() {
            self.loyalty.restore(customer_id, applied.coins).await?;
        }
        if previous == OrderStatus::Completed {
            let multiplier = match self.settings.refund_multiplier {
                RefundMultiplierPolicy::Current => self.loyalty.current_multiplier(customer_id).await?,
                RefundMultiplierPolicy::Recorded => order.accrual().map_or(Decimal::ONE, |a| a.multiplier),
            };
            self.loyalty.reverse(customer_id, order.cash_spent(), multiplier).await?;
        }
        Ok(())
    }

    /// Replaces what a completed line delivered. Not a state transition.
    pub async fn override_delivery(&self, order_id: Uuid, line_item_id: &str, codes: Vec<String>) -> Result<Order> {
        let _guard = self.transitions.lock().await;
        let mut order = self.get(order_id).await?;
        order.override_delivery(line_item_id, codes)?;
        self.orders.update(&order, OrderStatus::Completed).await?;
        info!(%order_id, line_item_id, "delivered items overridden");
        publish_all(self.events.as_ref(), order.take_events()).await;
        Ok(order)
    }

    async fn delivery_method(&self, category: &str) -> Result<DeliveryMethod> {
        Ok(self.categories.get(category).await?.map(|c| c.delivery_method).unwrap_or_default())
    }

    async fn check_custom_fields(&self, items: &[LineItem]) -> Result<()> {
        for item in items {
            if let Some(category) = self.categories.get(&item.category).await? {
                if let Some(field) = category.missing_field(&item.custom_fields) {
                    return Err(OrderError::MissingCustomField {
                        line_item_id: item.id.clone(), field: field.to_string(),
                    }.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Account, BalanceAdjustment, Category, CouponRejection, DiscountType, RedemptionRejected};
    use crate::infrastructure::memory::{in_memory_backends, RecordingPublisher};
    use crate::services::{LoyaltyRates, NewCoupon, Storefront};
    use async_trait::async_trait;
    use chrono::Duration;

    /// Hands out reads and then yields, so concurrent callers act on the same
    /// snapshot the way two server processes would.
    struct StaleReads<T: ?Sized>(Arc<T>);

    #[async_trait]
    impl OrderStore for StaleReads<dyn OrderStore> {
        async fn insert(&self, order: &Order) -> Result<()> { self.0.insert(order).await }
        async fn get(&self, id: Uuid) -> Result<Option<Order>> {
            let order = self.0.get(id).await;
            tokio::task::yield_now().await;
            order
        }
        async fn list_for_customer(&self, customer_id: &str) -> Result<Vec<Order>> { self.0.list_for_customer(customer_id).await }
        async fn count_for_customer(&self, customer_id: &str) -> Result<u64> { self.0.count_for_customer(customer_id).await }
        async fn update(&self, order: &Order, expected: OrderStatus) -> Result<()> { self.0.update(order, expected).await }
    }

    #[async_trait]
    impl AccountDirectory for StaleReads<dyn AccountDirectory> {
        async fn create(&self, account: &Account) -> Result<()> { self.0.create(account).await }
        async fn account(&self, id: &str) -> Result<Account> {
            let account = self.0.account(id).await;
            tokio::task::yield_now().await;
            account
        }
        async fn update_wallet_balance(&self, id: &str, delta: Decimal) -> Result<BalanceAdjustment<Decimal>> {
            self.0.update_wallet_balance(id, delta).await
        }
        async fn update_total_spent(&self, id: &str, delta: Decimal) -> Result<BalanceAdjustment<Decimal>> {
            self.0.update_total_spent(id, delta).await
        }
        async fn update_loyalty_coins(&self, id: &str, delta: i64) -> Result<BalanceAdjustment<i64>> {
            self.0.update_loyalty_coins(id, delta).await
        }
        async fn debit_wallet(&self, id: &str, amount: Decimal) -> Result<BalanceAdjustment<Decimal>> {
            self.0.debit_wallet(id, amount).await
        }
        async fn spend_coins(&self, id: &str, coins: i64) -> Result<BalanceAdjustment<i64>> {
            self.0.spend_coins(id, coins).await
        }
        async fn subscribe_to_premium(&self, id: &str, months: u32) -> Result<DateTime<Utc>> {
            self.0.subscribe_to_premium(id, months).await
        }
    }

    /// Two service graphs over one set of stores with stale reads, as if two
    /// server processes shared a database.
    async fn two_instances() -> (Storefront, Storefront) {
        let mut backends = in_memory_backends(Arc::new(RecordingPublisher::default()));
        backends.orders = Arc::new(StaleReads(backends.orders.clone()));
        backends.accounts = Arc::new(StaleReads(backends.accounts.clone()));
        let first = Storefront::new(backends.clone(), LoyaltyRates::default(), LifecycleSettings::default());
        let second = Storefront::new(backends, LoyaltyRates::default(), LifecycleSettings::default());
        first.categories.upsert(&Category::new("gift-cards", DeliveryMethod::Instant)).await.unwrap();
        first.accounts.create(&Account::open("alice").with_wallet(Decimal::new(100, 0)).with_coins(1_000)).await.unwrap();
        (first, second)
    }

    struct Harness {
        store: Storefront,
        events: Arc<RecordingPublisher>,
    }

    async fn harness(settings: LifecycleSettings) -> Harness {
        let events = Arc::new(RecordingPublisher::default());
        let backends = in_memory_backends(events.clone());
        let store = Storefront::new(backends, LoyaltyRates::default(), settings);
        store.categories.upsert(&Category::new("gift-cards", DeliveryMethod::Instant)).await.unwrap();
        store.categories.upsert(&Category::new("top-ups", DeliveryMethod::Manual).with_field("player_id", true)).await.unwrap();
        store.categories.upsert(&Category::new("memberships", DeliveryMethod::Manual)).await.unwrap();
        store.accounts.create(&Account::open("alice").with_wallet(Decimal::new(100, 0)).with_coins(1_000)).await.unwrap();
        Harness { store, events }
    }

    fn gift_card(id: &str, qty: u32, price: i64) -> LineItem {
        LineItem {
            id: id.into(), product_id: "steam-20".into(), variant_id: None, name: "Steam $20".into(),
            category: "gift-cards".into(), quantity: qty, unit_price: Decimal::new(price, 0), custom_fields: BTreeMap::new(),
        }
    }

    fn top_up(id: &str, player_id: Option<&str>) -> LineItem {
        let mut custom_fields = BTreeMap::new();
        if let Some(p) = player_id { custom_fields.insert("player_id".to_string(), p.to_string()); }
        LineItem {
            id: id.into(), product_id: "pubg-uc-600".into(), variant_id: Some("600".into()), name: "600 UC".into(),
            category: "top-ups".into(), quantity: 1, unit_price: Decimal::new(10, 0), custom_fields,
        }
    }

    fn draft(items: Vec<LineItem>) -> OrderDraft {
        OrderDraft { customer_id: "alice".into(), items, payment_method: PaymentMethod::External, coupon_code: None, loyalty_coins: 0 }
    }

    #[tokio::test]
    async fn test_place_complete_delivers_stock_and_accrues() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.stock.add_codes("steam-20", ["AAA", "BBB", "CCC"]).await.unwrap();
        let order = h.store.orders.place(draft(vec![gift_card("1", 2, 20)])).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.total(), Decimal::new(40, 0));

        let report = h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        assert!(report.shortfalls.is_empty());
        assert_eq!(report.order.status(), OrderStatus::Completed);
        assert_eq!(report.order.delivered_items()["1"], vec!["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(h.store.stock.available_count("steam-20").await.unwrap(), 1);

        let alice = h.store.accounts.account("alice").await.unwrap();
        assert_eq!(alice.total_spent, Decimal::new(400, 0));
        assert_eq!(alice.loyalty_coins, 1_040);
        assert_eq!(report.order.accrual().unwrap().multiplier, Decimal::ONE);

        let subjects = h.events.subjects().await;
        assert!(subjects.contains(&"storefront.order.placed".to_string()));
        assert!(subjects.contains(&"storefront.order.completed".to_string()));
    }

    #[tokio::test]
    async fn test_partial_delivery_is_reported_not_raised() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.stock.add_codes("steam-20", ["ONLY"]).await.unwrap();
        let order = h.store.orders.place(draft(vec![gift_card("1", 3, 20)])).await.unwrap();
        let report = h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        assert_eq!(report.order.status(), OrderStatus::Completed);
        assert_eq!(report.shortfalls, vec![DeliveryShortfall {
            line_item_id: "1".into(), product_id: "steam-20".into(), requested: 3, delivered: 1,
        }]);
        assert_eq!(report.order.delivered_items()["1"], vec!["ONLY".to_string()]);
    }

    #[tokio::test]
    async fn test_manual_lines_use_admin_overrides() {
        let h = harness(LifecycleSettings::default()).await;
        let order = h.store.orders.place(draft(vec![top_up("t1", Some("5551234")), gift_card("g1", 1, 20)])).await.unwrap();
        let overrides = HashMap::from([("t1".to_string(), vec!["Topped up, ref #981".to_string(), "  ".to_string()])]);
        let report = h.store.orders.complete(order.id(), overrides).await.unwrap();
        assert_eq!(report.order.delivered_items()["t1"], vec!["Topped up, ref #981".to_string()]);
        assert!(!report.order.delivered_items().contains_key("g1"));
        assert_eq!(report.shortfalls.len(), 1);
    }

    #[tokio::test]
    async fn test_required_custom_field_enforced() {
        let h = harness(LifecycleSettings::default()).await;
        let err = h.store.orders.place(draft(vec![top_up("t1", None)])).await.unwrap_err();
        assert!(matches!(err, StorefrontError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_complete_twice_is_noop() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.stock.add_codes("steam-20", ["A", "B"]).await.unwrap();
        let order = h.store.orders.place(draft(vec![gift_card("1", 1, 20)])).await.unwrap();
        h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        let again = h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        assert_eq!(again.order.delivered_items()["1"], vec!["A".to_string()]);
        assert_eq!(h.store.stock.available_count("steam-20").await.unwrap(), 1);
        assert_eq!(h.store.accounts.account("alice").await.unwrap().loyalty_coins, 1_020);
    }

    #[tokio::test]
    async fn test_wallet_payment_debited_at_placement_and_refunded() {
        let h = harness(LifecycleSettings::default()).await;
        let mut d = draft(vec![gift_card("1", 1, 30)]);
        d.payment_method = PaymentMethod::Wallet;
        let order = h.store.orders.place(d).await.unwrap();
        assert_eq!(h.store.accounts.account("alice").await.unwrap().wallet_balance, Decimal::new(70, 0));

        let refunded = h.store.orders.refund(order.id(), "out of stock").await.unwrap();
        assert_eq!(refunded.status(), OrderStatus::Refunded);
        assert_eq!(refunded.refund_info().unwrap().reason, "out of stock");
        assert_eq!(h.store.accounts.account("alice").await.unwrap().wallet_balance, Decimal::new(100, 0));

        let again = h.store.orders.refund(order.id(), "duplicate signal").await.unwrap();
        assert_eq!(again.refund_info().unwrap().reason, "out of stock");
        assert_eq!(h.store.accounts.account("alice").await.unwrap().wallet_balance, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn test_wallet_insufficient_balance_changes_nothing() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.coupons.create(NewCoupon {
            code: "ONCE".into(), discount_type: DiscountType::Fixed, value: Decimal::ONE, usage_limit: 1,
            expires_at: None, first_purchase_only: false,
        }).await.unwrap();
        let mut d = draft(vec![gift_card("1", 6, 20)]);
        d.payment_method = PaymentMethod::Wallet;
        d.coupon_code = Some("once".into());
        d.loyalty_coins = 100;
        let err = h.store.orders.place(d).await.unwrap_err();
        assert!(matches!(err, StorefrontError::InsufficientBalance { .. }));
        let alice = h.store.accounts.account("alice").await.unwrap();
        assert_eq!(alice.wallet_balance, Decimal::new(100, 0));
        assert_eq!(alice.loyalty_coins, 1_000);
        assert_eq!(h.store.coupons.get("ONCE").await.unwrap().unwrap().times_used, 0);
        assert!(h.store.orders.list_for_customer("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_then_refund_restores_coins() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.stock.add_codes("steam-20", ["A"]).await.unwrap();
        let mut d = draft(vec![gift_card("1", 1, 20)]);
        d.loyalty_coins = 500;
        let order = h.store.orders.place(d).await.unwrap();
        assert_eq!(order.total(), Decimal::new(15, 0));
        assert_eq!(h.store.accounts.account("alice").await.unwrap().loyalty_coins, 500);

        h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        let refunded = h.store.orders.refund(order.id(), "fraud").await.unwrap();
        assert_eq!(refunded.status(), OrderStatus::Refunded);
        assert_eq!(refunded.delivered_items()["1"], vec!["A".to_string()]);

        let alice = h.store.accounts.account("alice").await.unwrap();
        assert_eq!(alice.loyalty_coins, 1_000);
        assert_eq!(alice.total_spent, Decimal::ZERO);
        assert_eq!(h.store.stock.available_count("steam-20").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refunded_order_cannot_complete() {
        let h = harness(LifecycleSettings::default()).await;
        let order = h.store.orders.place(draft(vec![gift_card("1", 1, 20)])).await.unwrap();
        h.store.orders.refund(order.id(), "cancelled").await.unwrap();
        let err = h.store.orders.complete(order.id(), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, StorefrontError::InvalidTransition { from: OrderStatus::Refunded, to: OrderStatus::Completed }));
        assert_eq!(h.store.accounts.account("alice").await.unwrap().total_spent, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_coupon_applied_and_counted_once_per_order() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.coupons.create(NewCoupon {
            code: "Welcome".into(), discount_type: DiscountType::Percentage, value: Decimal::new(25, 0), usage_limit: 10,
            expires_at: None, first_purchase_only: true,
        }).await.unwrap();
        let mut d = draft(vec![gift_card("1", 2, 20)]);
        d.coupon_code = Some("welcome".into());
        let order = h.store.orders.place(d.clone()).await.unwrap();
        assert_eq!(order.discount().unwrap().amount, Decimal::new(10, 0));
        assert_eq!(order.total(), Decimal::new(30, 0));
        assert_eq!(order.cash_spent(), Decimal::new(40, 0));
        assert_eq!(h.store.coupons.get("WELCOME").await.unwrap().unwrap().times_used, 1);

        let err = h.store.orders.place(d).await.unwrap_err();
        assert!(matches!(err, StorefrontError::CouponRejected(CouponRejection::NotFirstPurchase)));

        h.store.orders.refund(order.id(), "requested").await.unwrap();
        assert_eq!(h.store.coupons.get("WELCOME").await.unwrap().unwrap().times_used, 1);
    }

    #[tokio::test]
    async fn test_fixed_coupon_capped_at_subtotal() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.coupons.create(NewCoupon {
            code: "FIFTY".into(), discount_type: DiscountType::Fixed, value: Decimal::new(50, 0), usage_limit: 5,
            expires_at: None, first_purchase_only: false,
        }).await.unwrap();
        let mut d = draft(vec![gift_card("1", 1, 20)]);
        d.coupon_code = Some("fifty".into());
        let order = h.store.orders.place(d).await.unwrap();
        assert_eq!(order.discount().unwrap().amount, Decimal::new(20, 0));
        assert_eq!(order.total(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_redemption_limited_to_order_value() {
        let h = harness(LifecycleSettings::default()).await;
        let mut d = draft(vec![gift_card("1", 1, 5)]);
        d.loyalty_coins = 600;
        let err = h.store.orders.place(d).await.unwrap_err();
        assert!(matches!(err, StorefrontError::RedemptionRejected(RedemptionRejected::ExceedsOrderValue { max: 500, .. })));
        assert_eq!(h.store.accounts.account("alice").await.unwrap().loyalty_coins, 1_000);
    }

    #[tokio::test]
    async fn test_premium_product_activates_subscription_and_boosts_xp() {
        let h = harness(LifecycleSettings::default()).await;
        let premium = LineItem {
            id: "m1".into(), product_id: "valhalla-premium".into(), variant_id: None, name: "Premium".into(),
            category: "memberships".into(), quantity: 3, unit_price: Decimal::new(5, 0), custom_fields: BTreeMap::new(),
        };
        let order = h.store.orders.place(draft(vec![premium])).await.unwrap();
        let report = h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        let until = report.premium_until.unwrap();
        assert!(until > Utc::now() + Duration::days(85));
        let alice = h.store.accounts.account("alice").await.unwrap();
        assert_eq!(alice.premium_until, Some(until));
        assert_eq!(alice.total_spent, Decimal::new(225, 0));
        assert_eq!(report.order.accrual().unwrap().multiplier, Decimal::new(15, 1));
    }

    #[tokio::test]
    async fn test_recorded_policy_reverses_with_completion_multiplier() {
        let settings = LifecycleSettings { refund_multiplier: RefundMultiplierPolicy::Recorded, ..Default::default() };
        let h = harness(settings).await;
        h.store.stock.add_codes("steam-20", ["A"]).await.unwrap();
        let order = h.store.orders.place(draft(vec![gift_card("1", 1, 20)])).await.unwrap();
        h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        h.store.accounts.subscribe_to_premium("alice", 1).await.unwrap();
        h.store.orders.refund(order.id(), "requested").await.unwrap();
        assert_eq!(h.store.accounts.account("alice").await.unwrap().total_spent, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_current_policy_uses_status_at_refund() {
        let h = harness(LifecycleSettings::default()).await;
        h.store.stock.add_codes("steam-20", ["A"]).await.unwrap();
        h.store.accounts.update_total_spent("alice", Decimal::new(1_000, 0)).await.unwrap();
        let order = h.store.orders.place(draft(vec![gift_card("1", 1, 20)])).await.unwrap();
        h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        h.store.accounts.subscribe_to_premium("alice", 1).await.unwrap();
        h.store.orders.refund(order.id(), "requested").await.unwrap();
        // 200 XP credited at 1x, 300 taken back at 1.5x.
        assert_eq!(h.store.accounts.account("alice").await.unwrap().total_spent, Decimal::new(900, 0));
    }

    #[tokio::test]
    async fn test_override_delivery_after_completion() {
        let h = harness(LifecycleSettings::default()).await;
        let order = h.store.orders.place(draft(vec![gift_card("1", 1, 20)])).await.unwrap();
        assert!(matches!(
            h.store.orders.override_delivery(order.id(), "1", vec!["X".into()]).await,
            Err(StorefrontError::OrderNotCompleted(OrderStatus::Pending))
        ));
        h.store.orders.complete(order.id(), HashMap::new()).await.unwrap();
        let fixed = h.store.orders.override_delivery(order.id(), "1", vec!["MANUAL-CODE".into()]).await.unwrap();
        assert_eq!(fixed.delivered_items()["1"], vec!["MANUAL-CODE".to_string()]);
        assert_eq!(h.store.orders.get(order.id()).await.unwrap().status(), OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_wallet_orders_cannot_overdraw() {
        let (a, b) = two_instances().await;
        a.coupons.create(NewCoupon {
            code: "ONCE".into(), discount_type: DiscountType::Fixed, value: Decimal::ONE, usage_limit: 1,
            expires_at: None, first_purchase_only: false,
        }).await.unwrap();
        let mut plain = draft(vec![gift_card("1", 3, 20)]);
        plain.payment_method = PaymentMethod::Wallet;
        let mut discounted = plain.clone();
        discounted.coupon_code = Some("ONCE".into());
        discounted.loyalty_coins = 100;

        let (first, second) = tokio::join!(a.orders.place(plain), b.orders.place(discounted));
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loser = first.as_ref().err().or(second.as_ref().err()).unwrap();
        assert!(matches!(loser, StorefrontError::InsufficientBalance { .. }));

        let alice = a.accounts.account("alice").await.unwrap();
        let used = a.coupons.get("ONCE").await.unwrap().unwrap().times_used;
        if second.is_ok() {
            assert_eq!((alice.wallet_balance, alice.loyalty_coins, used), (Decimal::new(42, 0), 900, 1));
        } else {
            assert_eq!((alice.wallet_balance, alice.loyalty_coins, used), (Decimal::new(40, 0), 1_000, 0));
        }
        assert_eq!(a.orders.list_for_customer("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_coupon_use_lost_to_another_order_gives_back_balances() {
        let (a, b) = two_instances().await;
        a.coupons.create(NewCoupon {
            code: "ONCE".into(), discount_type: DiscountType::Fixed, value: Decimal::ONE, usage_limit: 1,
            expires_at: None, first_purchase_only: false,
        }).await.unwrap();
        let mut external = draft(vec![gift_card("1", 1, 20)]);
        external.coupon_code = Some("ONCE".into());
        let mut wallet = external.clone();
        wallet.payment_method = PaymentMethod::Wallet;
        wallet.loyalty_coins = 100;

        let (first, second) = tokio::join!(a.orders.place(external), b.orders.place(wallet));
        assert!(first.is_ok());
        assert!(matches!(second, Err(StorefrontError::CouponRejected(CouponRejection::LimitReached))));
        let alice = a.accounts.account("alice").await.unwrap();
        assert_eq!((alice.wallet_balance, alice.loyalty_coins), (Decimal::new(100, 0), 1_000));
        assert_eq!(a.coupons.get("ONCE").await.unwrap().unwrap().times_used, 1);
        assert_eq!(a.orders.list_for_customer("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refunds_return_payment_once() {
        let (a, b) = two_instances().await;
        let mut d = draft(vec![gift_card("1", 1, 30)]);
        d.payment_method = PaymentMethod::Wallet;
        d.loyalty_coins = 200;
        let order = a.orders.place(d).await.unwrap();
        assert_eq!(a.accounts.account("alice").await.unwrap().wallet_balance, Decimal::new(72, 0));

        let (first, second) = tokio::join!(a.orders.refund(order.id(), "first"), b.orders.refund(order.id(), "second"));
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(first.as_ref().err().or(second.as_ref().err()), Some(StorefrontError::Conflict(_))));
        let alice = a.accounts.account("alice").await.unwrap();
        assert_eq!(alice.wallet_balance, Decimal::new(100, 0));
        assert_eq!(alice.loyalty_coins, 1_000);
    }

    #[tokio::test]
    async fn test_concurrent_completions_deliver_once() {
        let (a, b) = two_instances().await;
        a.stock.add_codes("steam-20", ["A", "B", "C"]).await.unwrap();
        let order = a.orders.place(draft(vec![gift_card("1", 1, 20)])).await.unwrap();

        let (first, second) = tokio::join!(
            a.orders.complete(order.id(), HashMap::new()),
            b.orders.complete(order.id(), HashMap::new()),
        );
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(first.as_ref().err().or(second.as_ref().err()), Some(StorefrontError::Conflict(_))));
        assert_eq!(a.stock.available_count("steam-20").await.unwrap(), 2);
        let alice = a.accounts.account("alice").await.unwrap();
        assert_eq!(alice.loyalty_coins, 1_020);
        assert_eq!(alice.total_spent, Decimal::new(200, 0));
        let stored = a.orders.get(order.id()).await.unwrap();
        assert_eq!(stored.status(), OrderStatus::Completed);
        assert_eq!(stored.delivered_items()["1"].len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_amounts_rejected_before_anything_moves() {
        let h = harness(LifecycleSettings::default()).await;
        let mut huge = gift_card("1", 1, 0);
        huge.unit_price = Decimal::MAX;
        let err = h.store.orders.place(draft(vec![huge.clone()])).await.unwrap_err();
        assert!(matches!(err, StorefrontError::InvalidInput(_)));
        huge.quantity = 2;
        assert!(matches!(h.store.orders.place(draft(vec![huge])).await, Err(StorefrontError::InvalidInput(_))));

        let premium = |id: &str| LineItem {
            id: id.into(), product_id: "valhalla-premium".into(), variant_id: None, name: "Premium".into(),
            category: "memberships".into(), quantity: u32::MAX, unit_price: Decimal::ZERO, custom_fields: BTreeMap::new(),
        };
        let err = h.store.orders.place(draft(vec![premium("m1"), premium("m2")])).await.unwrap_err();
        assert!(matches!(err, StorefrontError::InvalidInput(_)));
        assert!(h.store.orders.list_for_customer("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_order_and_account() {
        let h = harness(LifecycleSettings::default()).await;
        assert!(matches!(h.store.orders.refund(Uuid::now_v7(), "x").await, Err(StorefrontError::OrderNotFound(_))));
        let mut d = draft(vec![gift_card("1", 1, 20)]);
        d.customer_id = "bob".into();
        assert!(matches!(h.store.orders.place(d).await, Err(StorefrontError::AccountNotFound(_))));
    }
}
