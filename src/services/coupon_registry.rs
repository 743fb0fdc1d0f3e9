//! Coupon registry: eligibility checks and usage counting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::domain::aggregates::{Coupon, CouponRejection, DiscountType};
use crate::domain::events::{CouponEvent, DomainEvent};
use crate::domain::value_objects::CouponCode;
use crate::ports::{CouponStore, EventPublisher};
use crate::services::publish_all;
use crate::{Result, StorefrontError};

#[derive(Clone, Debug, Deserialize)]
pub struct NewCoupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub value: Decimal,
    pub usage_limit: u32,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_purchase_only: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CouponValidation {
    Valid(Coupon),
    Invalid(CouponRejection),
}

impl CouponValidation {
    pub fn is_valid(&self) -> bool { matches!(self, Self::Valid(_)) }
}

pub struct CouponRegistry {
    store: Arc<dyn CouponStore>,
    events: Arc<dyn EventPublisher>,
}

impl CouponRegistry {
    pub fn new(store: Arc<dyn CouponStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    pub async fn create(&self, new: NewCoupon) -> Result<Coupon> {
        let code = CouponCode::new(new.code).map_err(|e| StorefrontError::InvalidInput(e.to_string()))?;
        let coupon = Coupon::create(code, new.discount_type, new.value, new.usage_limit, new.expires_at, new.first_purchase_only)
            .map_err(|e| StorefrontError::InvalidInput(e.to_string()))?;
        self.store.insert(&coupon).await?;
        info!(code = %coupon.code, discount_type = %coupon.discount_type, value = %coupon.value, "coupon created");
        publish_all(self.events.as_ref(), vec![DomainEvent::Coupon(CouponEvent::Created { code: coupon.code.to_string() })]).await;
        Ok(coupon)
    }

    pub async fn get(&self, code: &str) -> Result<Option<Coupon>> {
        match CouponCode::new(code) {
            Ok(code) => self.store.get(&code).await,
            Err(_) => Ok(None),
        }
    }

    /// Checks existence, usage limit, expiry and first-purchase eligibility,
    /// in that order. Only the first failure is reported.
    pub async fn validate(&self, code: &str, prior_orders: u64) -> Result<CouponValidation> {
        let Some(coupon) = self.get(code).await? else {
            return Ok(CouponValidation::Invalid(CouponRejection::NotFound));
        };
        Ok(match coupon.check(prior_orders, Utc::now()) {
            Ok(()) => CouponValidation::Valid(coupon),
            Err(rejection) => CouponValidation::Invalid(rejection),
        })
    }

    /// A fixed discount may exceed `subtotal`; callers clamp.
    pub fn compute_discount(coupon: &Coupon, subtotal: Decimal) -> Decimal {
        coupon.discount_for(subtotal)
    }

    /// Counts one use. Calling it twice for the same order counts twice.
    pub async fn mark_used(&self, code: &str) -> Result<Coupon> {
        let code = CouponCode::new(code).map_err(|_| StorefrontError::CouponRejected(CouponRejection::NotFound))?;
        let coupon = self.store.record_use(&code).await?;
        info!(code = %coupon.code, times_used = coupon.times_used, usage_limit = coupon.usage_limit, "coupon used");
        publish_all(self.events.as_ref(), vec![DomainEvent::Coupon(CouponEvent::Used {
            code: coupon.code.to_string(), times_used: coupon.times_used,
        })]).await;
        Ok(coupon)
    }
}
