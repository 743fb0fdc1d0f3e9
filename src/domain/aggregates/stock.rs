//! Stock items: one redeemable code each

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    pub id: Uuid,
    pub product_id: String,
    pub code: String,
    pub is_used: bool,
    pub added_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl StockItem {
    pub fn new(product_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(), product_id: product_id.into(), code: code.into(),
            is_used: false, added_at: Utc::now(), used_at: None,
        }
    }

    pub fn mark_used(&mut self, now: DateTime<Utc>) {
        self.is_used = true;
        self.used_at = Some(now);
    }

    /// Administrative correction; the only way an item becomes unused again.
    pub fn correct(&mut self, is_used: bool, now: DateTime<Utc>) {
        if is_used { if !self.is_used { self.mark_used(now); } }
        else { self.is_used = false; self.used_at = None; }
    }
}

/// Result of drawing codes for one product. Fewer codes than requested is a
/// shortfall, not an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub product_id: String,
    pub requested: u32,
    pub codes: Vec<String>,
}

impl Allocation {
    pub fn delivered(&self) -> u32 { self.codes.len() as u32 }
    pub fn shortfall(&self) -> u32 { self.requested.saturating_sub(self.delivered()) }
    pub fn is_short(&self) -> bool { self.shortfall() > 0 }
}
