//! Application services: stock ledger, loyalty accrual, coupon registry and
//! the order lifecycle that coordinates them.

pub mod coupon_registry;
pub mod loyalty;
pub mod order_lifecycle;
pub mod stock_ledger;

use std::sync::Arc;
use tracing::warn;

use crate::domain::events::DomainEvent;
use crate::ports::{AccountDirectory, CategoryCatalog, CouponStore, EventPublisher, OrderStore, StockStore};

pub use coupon_registry::{CouponRegistry, CouponValidation, NewCoupon};
pub use loyalty::{LoyaltyAccrual, LoyaltyRates, Redemption, Reversal};
pub use order_lifecycle::{CompletionReport, DeliveryShortfall, LifecycleSettings, OrderDraft, OrderLifecycle, RefundMultiplierPolicy};
pub use stock_ledger::StockLedger;

/// Storage and messaging adapters the services run on.
#[derive(Clone)]
pub struct Backends {
    pub orders: Arc<dyn OrderStore>,
    pub stock: Arc<dyn StockStore>,
    pub coupons: Arc<dyn CouponStore>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub categories: Arc<dyn CategoryCatalog>,
    pub events: Arc<dyn EventPublisher>,
}

/// Fully wired service graph, shared by the HTTP handlers.
#[derive(Clone)]
pub struct Storefront {
    pub stock: Arc<StockLedger>,
    pub loyalty: Arc<LoyaltyAccrual>,
    pub coupons: Arc<CouponRegistry>,
    pub orders: Arc<OrderLifecycle>,
    pub accounts: Arc<dyn AccountDirectory>,
    pub categories: Arc<dyn CategoryCatalog>,
}

impl Storefront {
    pub fn new(backends: Backends, rates: LoyaltyRates, settings: LifecycleSettings) -> Self {
        let stock = Arc::new(StockLedger::new(backends.stock.clone(), backends.events.clone()));
        let loyalty = Arc::new(LoyaltyAccrual::new(backends.accounts.clone(), rates));
        let coupons = Arc::new(CouponRegistry::new(backends.coupons.clone(), backends.events.clone()));
        let orders = Arc::new(OrderLifecycle::new(&backends, stock.clone(), loyalty.clone(), coupons.clone(), settings));
        Self { stock, loyalty, coupons, orders, accounts: backends.accounts, categories: backends.categories }
    }
}

/// Publishes events one by one. A failed publish is logged and skipped; it
/// never fails the operation that raised the event.
pub(crate) async fn publish_all(publisher: &dyn EventPublisher, events: Vec<DomainEvent>) {
    for event in events {
        if let Err(e) = publisher.publish(&event).await {
            warn!(subject = %event.subject(), error = %e, "failed to publish domain event");
        }
    }
}
