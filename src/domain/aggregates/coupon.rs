//! Coupon Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use crate::domain::value_objects::CouponCode;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: CouponCode,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub usage_limit: u32,
    pub times_used: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub first_purchase_only: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountType { Percentage, Fixed }

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Percentage => "percentage", Self::Fixed => "fixed" }
    }
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for DiscountType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "percentage" => Ok(Self::Percentage),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown discount type: {other}")),
        }
    }
}

/// Why a coupon cannot be applied. Only the first failing check is reported.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponRejection {
    #[error("coupon not found")]
    NotFound,
    #[error("coupon usage limit reached")]
    LimitReached,
    #[error("coupon expired")]
    Expired,
    #[error("coupon is valid on a first purchase only")]
    NotFirstPurchase,
}

impl Coupon {
    pub fn create(
        code: CouponCode, discount_type: DiscountType, value: Decimal, usage_limit: u32,
        expires_at: Option<DateTime<Utc>>, first_purchase_only: bool,
    ) -> Result<Self, InvalidCoupon> {
        if value <= Decimal::ZERO { return Err(InvalidCoupon::NonPositiveValue); }
        if discount_type == DiscountType::Percentage && value > Decimal::ONE_HUNDRED {
            return Err(InvalidCoupon::PercentageOver100);
        }
        if usage_limit == 0 { return Err(InvalidCoupon::ZeroUsageLimit); }
        Ok(Self {
            code, discount_type, value, usage_limit, times_used: 0, expires_at, first_purchase_only,
            created_at: Utc::now(),
        })
    }

    pub fn is_exhausted(&self) -> bool { self.times_used >= self.usage_limit }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now > at)
    }

    /// Eligibility checks after existence: limit, expiry, first purchase.
    pub fn check(&self, prior_orders: u64, now: DateTime<Utc>) -> Result<(), CouponRejection> {
        if self.is_exhausted() { return Err(CouponRejection::LimitReached); }
        if self.is_expired_at(now) { return Err(CouponRejection::Expired); }
        if self.first_purchase_only && prior_orders > 0 { return Err(CouponRejection::NotFirstPurchase); }
        Ok(())
    }

    /// Discount for a subtotal. A fixed discount is not capped here and may
    /// exceed the subtotal.
    pub fn discount_for(&self, subtotal: Decimal) -> Decimal {
        match self.discount_type {
            DiscountType::Fixed => self.value,
            DiscountType::Percentage => subtotal * self.value / Decimal::ONE_HUNDRED,
        }
    }

    pub fn record_use(&mut self) -> Result<u32, CouponRejection> {
        if self.is_exhausted() { return Err(CouponRejection::LimitReached); }
        self.times_used += 1;
        Ok(self.times_used)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum InvalidCoupon { NonPositiveValue, PercentageOver100, ZeroUsageLimit }
impl std::error::Error for InvalidCoupon {}
impl fmt::Display for InvalidCoupon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveValue => write!(f, "Discount value must be positive"),
            Self::PercentageOver100 => write!(f, "Percentage discount above 100"),
            Self::ZeroUsageLimit => write!(f, "Usage limit must be at least 1"),
        }
    }
}
