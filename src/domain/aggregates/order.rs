//! Order Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;
use crate::domain::events::{DomainEvent, OrderEvent};
use crate::domain::value_objects::{CouponCode, PaymentMethod};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    id: Uuid,
    customer_id: String,
    items: Vec<LineItem>,
    subtotal: Decimal,
    total: Decimal,
    payment_method: PaymentMethod,
    status: OrderStatus,
    discount: Option<AppliedDiscount>,
    loyalty: Option<AppliedLoyalty>,
    delivered_items: BTreeMap<String, Vec<String>>,
    accrual: Option<AccrualRecord>,
    refund: Option<RefundInfo>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    events: Vec<DomainEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub name: String,
    /// Category name; decides manual or instant delivery.
    pub category: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}

impl LineItem {
    /// `None` when the product does not fit in a `Decimal`.
    pub fn line_total(&self) -> Option<Decimal> { self.unit_price.checked_mul(Decimal::from(self.quantity)) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)] pub struct AppliedDiscount { pub code: CouponCode, pub amount: Decimal }
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)] pub struct AppliedLoyalty { pub coins: i64, pub value_usd: Decimal }
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)] pub struct RefundInfo { pub reason: String, pub refunded_at: DateTime<Utc> }

/// What completion credited to the customer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccrualRecord { pub xp: Decimal, pub coins: i64, pub multiplier: Decimal }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus { #[default] Pending, Completed, Refunded }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Pending => "pending", Self::Completed => "completed", Self::Refunded => "refunded" }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl Order {
    /// Sums the line items after checking there is at least one and that
    /// every line is well formed.
    pub fn subtotal_of(items: &[LineItem]) -> Result<Decimal, OrderError> {
        if items.is_empty() { return Err(OrderError::NoItems); }
        let mut seen = HashSet::new();
        for item in items {
            if item.id.trim().is_empty() { return Err(OrderError::MissingLineItemId); }
            if !seen.insert(item.id.as_str()) { return Err(OrderError::DuplicateLineItem(item.id.clone())); }
            if item.quantity == 0 { return Err(OrderError::InvalidQuantity(item.id.clone())); }
            if item.unit_price < Decimal::ZERO { return Err(OrderError::NegativePrice(item.id.clone())); }
        }
        items.iter().try_fold(Decimal::ZERO, |sum, item| {
            item.line_total().and_then(|total| sum.checked_add(total)).ok_or(OrderError::AmountOverflow)
        })
    }

    pub fn place(
        customer_id: impl Into<String>, items: Vec<LineItem>, payment_method: PaymentMethod,
        discount: Option<AppliedDiscount>, loyalty: Option<AppliedLoyalty>,
    ) -> Result<Self, OrderError> {
        let subtotal = Self::subtotal_of(&items)?;
        let deductions = discount.as_ref().map_or(Decimal::ZERO, |d| d.amount)
            .checked_add(loyalty.as_ref().map_or(Decimal::ZERO, |l| l.value_usd))
            .ok_or(OrderError::AmountOverflow)?;
        let total = (subtotal - deductions).max(Decimal::ZERO);
        let now = Utc::now();
        let mut order = Self {
            id: Uuid::now_v7(), customer_id: customer_id.into(), items, subtotal, total, payment_method,
            status: OrderStatus::Pending, discount, loyalty, delivered_items: BTreeMap::new(), accrual: None,
            refund: None, completed_at: None, created_at: now, updated_at: now, events: vec![],
        };
        order.raise_event(DomainEvent::Order(OrderEvent::Placed {
            order_id: order.id, customer_id: order.customer_id.clone(), total,
        }));
        Ok(order)
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn customer_id(&self) -> &str { &self.customer_id }
    pub fn items(&self) -> &[LineItem] { &self.items }
    pub fn subtotal(&self) -> Decimal { self.subtotal }
    pub fn total(&self) -> Decimal { self.total }
    pub fn payment_method(&self) -> PaymentMethod { self.payment_method }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn discount(&self) -> Option<&AppliedDiscount> { self.discount.as_ref() }
    pub fn loyalty(&self) -> Option<&AppliedLoyalty> { self.loyalty.as_ref() }
    pub fn delivered_items(&self) -> &BTreeMap<String, Vec<String>> { &self.delivered_items }
    pub fn accrual(&self) -> Option<&AccrualRecord> { self.accrual.as_ref() }
    pub fn refund_info(&self) -> Option<&RefundInfo> { self.refund.as_ref() }
    pub fn completed_at(&self) -> Option<DateTime<Utc>> { self.completed_at }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    /// Cash-equivalent basis for loyalty: discounts are added back and
    /// redeemed coins taken out.
    pub fn cash_spent(&self) -> Decimal {
        self.total + self.discount.as_ref().map_or(Decimal::ZERO, |d| d.amount)
            - self.loyalty.as_ref().map_or(Decimal::ZERO, |l| l.value_usd)
    }

    /// `Ok(true)` when the move is allowed, `Ok(false)` when the order is
    /// already in `to`.
    pub fn can_transition(&self, to: OrderStatus) -> Result<bool, OrderError> {
        use OrderStatus::*;
        match (self.status, to) {
            (from, to) if from == to => Ok(false),
            (Pending, Completed) | (Pending, Refunded) | (Completed, Refunded) => Ok(true),
            (from, to) => Err(OrderError::InvalidTransition { from, to }),
        }
    }

    /// Moves a pending order to completed before anything is delivered, so
    /// the status change can be claimed first. `Ok(false)` when the order is
    /// already completed.
    pub fn begin_completion(&mut self) -> Result<bool, OrderError> {
        if !self.can_transition(OrderStatus::Completed)? { return Ok(false); }
        self.status = OrderStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.touch();
        Ok(true)
    }

    /// Records what a claimed completion delivered and credited.
    pub fn record_fulfilment(
        &mut self, delivered: BTreeMap<String, Vec<String>>, accrual: Option<AccrualRecord>, short_lines: usize,
    ) -> Result<(), OrderError> {
        if self.status != OrderStatus::Completed { return Err(OrderError::NotCompleted(self.status)); }
        for (line_id, codes) in delivered {
            self.delivered_items.entry(line_id).or_default().extend(codes);
        }
        self.accrual = accrual;
        self.touch();
        let delivered_codes = self.delivered_items.values().map(Vec::len).sum();
        self.raise_event(DomainEvent::Order(OrderEvent::Completed { order_id: self.id, delivered_codes, short_lines }));
        Ok(())
    }

    pub fn refund(&mut self, reason: impl Into<String>) -> Result<(), OrderError> {
        if !self.can_transition(OrderStatus::Refunded)? { return Ok(()); }
        let was_completed = self.status == OrderStatus::Completed;
        let reason = reason.into();
        self.refund = Some(RefundInfo { reason: reason.clone(), refunded_at: Utc::now() });
        self.status = OrderStatus::Refunded;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Refunded { order_id: self.id, reason, was_completed }));
        Ok(())
    }

    /// Out-of-band admin correction of what a completed line delivered.
    pub fn override_delivery(&mut self, line_item_id: &str, codes: Vec<String>) -> Result<(), OrderError> {
        if self.status != OrderStatus::Completed { return Err(OrderError::NotCompleted(self.status)); }
        if !self.items.iter().any(|i| i.id == line_item_id) {
            return Err(OrderError::LineItemNotFound(line_item_id.to_string()));
        }
        self.delivered_items.insert(line_item_id.to_string(), codes);
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::DeliveryOverridden {
            order_id: self.id, line_item_id: line_item_id.to_string(),
        }));
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    NoItems,
    MissingLineItemId,
    DuplicateLineItem(String),
    InvalidQuantity(String),
    NegativePrice(String),
    LineItemNotFound(String),
    MissingCustomField { line_item_id: String, field: String },
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    NotCompleted(OrderStatus),
    AmountOverflow,
}
impl std::error::Error for OrderError {}
impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoItems => write!(f, "No items"),
            Self::MissingLineItemId => write!(f, "Line item without id"),
            Self::DuplicateLineItem(id) => write!(f, "Duplicate line item {id}"),
            Self::InvalidQuantity(id) => write!(f, "Invalid quantity on line {id}"),
            Self::NegativePrice(id) => write!(f, "Negative price on line {id}"),
            Self::LineItemNotFound(id) => write!(f, "Line item {id} not found"),
            Self::MissingCustomField { line_item_id, field } => write!(f, "Line {line_item_id} is missing {field}"),
            Self::InvalidTransition { from, to } => write!(f, "Cannot move order from {from} to {to}"),
            Self::NotCompleted(status) => write!(f, "Order is {status}, not completed"),
            Self::AmountOverflow => write!(f, "Order amount out of range"),
        }
    }
}
