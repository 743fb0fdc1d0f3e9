//! Stock ledger: per-product pools of redemption codes.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::aggregates::{Allocation, StockItem};
use crate::domain::events::{DomainEvent, StockEvent};
use crate::ports::{EventPublisher, StockStore};
use crate::services::publish_all;
use crate::{Result, StorefrontError};

pub struct StockLedger {
    store: Arc<dyn StockStore>,
    events: Arc<dyn EventPublisher>,
}

impl StockLedger {
    pub fn new(store: Arc<dyn StockStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    /// Appends one unused item per non-blank code, in the given order.
    /// Duplicate codes are accepted as-is.
    pub async fn add_codes<I, S>(&self, product_id: &str, codes: I) -> Result<Vec<StockItem>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let product_id = product_id.trim();
        if product_id.is_empty() {
            return Err(StorefrontError::InvalidInput("product id is required".into()));
        }
        let items: Vec<StockItem> = codes
            .into_iter()
            .filter_map(|c| {
                let code = c.as_ref().trim();
                (!code.is_empty()).then(|| StockItem::new(product_id, code))
            })
            .collect();
        if items.is_empty() {
            return Ok(items);
        }
        self.store.insert(&items).await?;
        info!(product_id, count = items.len(), "stock codes added");
        publish_all(self.events.as_ref(), vec![DomainEvent::Stock(StockEvent::CodesAdded {
            product_id: product_id.to_string(), count: items.len(),
        })]).await;
        Ok(items)
    }

    pub async fn available_count(&self, product_id: &str) -> Result<u64> {
        self.store.available_count(product_id).await
    }

    /// Hands out up to `quantity` codes, oldest first. A shortfall is
    /// reported on the returned [`Allocation`], never as an error.
    pub async fn allocate(&self, product_id: &str, quantity: u32) -> Result<Allocation> {
        let codes = if quantity == 0 {
            vec![]
        } else {
            self.store.take_unused(product_id, quantity, Utc::now()).await?
                .into_iter()
                .map(|item| item.code)
                .collect()
        };
        let allocation = Allocation { product_id: product_id.to_string(), requested: quantity, codes };
        if allocation.is_short() {
            warn!(product_id, requested = quantity, delivered = allocation.delivered(), "insufficient stock, partial delivery");
        }
        publish_all(self.events.as_ref(), vec![DomainEvent::Stock(StockEvent::Allocated {
            product_id: product_id.to_string(), requested: quantity, delivered: allocation.delivered(),
        })]).await;
        Ok(allocation)
    }

    pub async fn list(&self, product_id: &str) -> Result<Vec<StockItem>> {
        self.store.list(product_id).await
    }

    /// Administrative correction of an item's used flag.
    pub async fn correct(&self, item_id: Uuid, is_used: bool) -> Result<StockItem> {
        let item = self.store.correct(item_id, is_used, Utc::now()).await?;
        info!(%item_id, is_used, product_id = %item.product_id, "stock item corrected");
        publish_all(self.events.as_ref(), vec![DomainEvent::Stock(StockEvent::Corrected { item_id, is_used })]).await;
        Ok(item)
    }
}
