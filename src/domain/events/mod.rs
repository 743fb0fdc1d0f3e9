//! Domain events
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "aggregate", rename_all = "snake_case")]
pub enum DomainEvent {
    Order(OrderEvent),
    Stock(StockEvent),
    Coupon(CouponEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    Placed { order_id: Uuid, customer_id: String, total: Decimal },
    Completed { order_id: Uuid, delivered_codes: usize, short_lines: usize },
    Refunded { order_id: Uuid, reason: String, was_completed: bool },
    DeliveryOverridden { order_id: Uuid, line_item_id: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StockEvent {
    CodesAdded { product_id: String, count: usize },
    Allocated { product_id: String, requested: u32, delivered: u32 },
    Corrected { item_id: Uuid, is_used: bool },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CouponEvent {
    Created { code: String },
    Used { code: String, times_used: u32 },
}

impl DomainEvent {
    /// NATS subject the event is published on, e.g. `storefront.order.placed`.
    pub fn subject(&self) -> String {
        let (aggregate, name) = match self {
            Self::Order(e) => ("order", match e {
                OrderEvent::Placed { .. } => "placed",
                OrderEvent::Completed { .. } => "completed",
                OrderEvent::Refunded { .. } => "refunded",
                OrderEvent::DeliveryOverridden { .. } => "delivery_overridden",
            }),
            Self::Stock(e) => ("stock", match e {
                StockEvent::CodesAdded { .. } => "codes_added",
                StockEvent::Allocated { .. } => "allocated",
                StockEvent::Corrected { .. } => "corrected",
            }),
            Self::Coupon(e) => ("coupon", match e {
                CouponEvent::Created { .. } => "created",
                CouponEvent::Used { .. } => "used",
            }),
        };
        format!("storefront.{aggregate}.{name}")
    }
}
