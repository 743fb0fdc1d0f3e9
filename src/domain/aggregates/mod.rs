//! Aggregates module
pub mod account;
pub mod category;
pub mod coupon;
pub mod order;
pub mod stock;

pub use account::{Account, BalanceAdjustment, BalanceValue, InsufficientFunds, RedemptionRejected};
pub use category::{Category, CustomField};
pub use coupon::{Coupon, CouponRejection, DiscountType, InvalidCoupon};
pub use order::{AccrualRecord, AppliedDiscount, AppliedLoyalty, LineItem, Order, OrderError, OrderStatus, RefundInfo};
pub use stock::{Allocation, StockItem};
