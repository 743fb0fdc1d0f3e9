//! Valhalla Storefront - order fulfillment service for digital goods
//!
//! Backend core of a storefront selling game top-ups, subscriptions and
//! gift cards.
//!
//! ## Features
//! - Stock ledger of per-product redemption codes with oldest-first allocation
//! - Loyalty accrual (XP and Valhalla coins) with a premium multiplier
//! - Coupon validation and usage tracking
//! - Order lifecycle: pending -> completed / refunded
//! - In-memory and PostgreSQL storage, NATS domain events, JSON HTTP API

pub mod api;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod ports;
pub mod services;

use thiserror::Error;

use crate::domain::aggregates::{CouponRejection, InsufficientFunds, OrderError, OrderStatus, RedemptionRejected};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum StorefrontError {
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Stock item not found: {0}")]
    StockItemNotFound(String),

    #[error("Line item not found: {0}")]
    LineItemNotFound(String),

    #[error("Coupon rejected: {0}")]
    CouponRejected(CouponRejection),

    #[error("Coupon already exists: {0}")]
    CouponExists(String),

    #[error("Loyalty redemption rejected: {0}")]
    RedemptionRejected(RedemptionRejected),

    #[error("Insufficient wallet balance: need {needed}, have {available}")]
    InsufficientBalance {
        needed: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order is {0}, not completed")]
    OrderNotCompleted(OrderStatus),

    #[error("Order {0} was modified concurrently")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Event publishing error: {0}")]
    Events(String),
}

impl From<CouponRejection> for StorefrontError {
    fn from(rejection: CouponRejection) -> Self {
        Self::CouponRejected(rejection)
    }
}

impl From<RedemptionRejected> for StorefrontError {
    fn from(rejection: RedemptionRejected) -> Self {
        Self::RedemptionRejected(rejection)
    }
}

impl From<InsufficientFunds> for StorefrontError {
    fn from(e: InsufficientFunds) -> Self {
        Self::InsufficientBalance { needed: e.needed, available: e.available }
    }
}

impl From<OrderError> for StorefrontError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            OrderError::NotCompleted(status) => Self::OrderNotCompleted(status),
            OrderError::LineItemNotFound(id) => Self::LineItemNotFound(id),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorefrontError>;
