//! Account balances owned by the auth provider

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::ops::Sub;
use thiserror::Error;

/// Balance fields of a customer. Every balance is kept at or above zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub wallet_balance: Decimal,
    pub loyalty_coins: i64,
    /// Cumulative spend expressed in XP; drives the cosmetic rank.
    pub total_spent: Decimal,
    pub premium_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a balance mutation. `clamped` is set when the delta would have
/// taken the balance below zero and the balance was floored instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BalanceAdjustment<T> {
    pub before: T,
    pub after: T,
    pub clamped: bool,
}

/// Balance arithmetic that saturates instead of panicking.
pub trait BalanceValue: Copy + PartialOrd + Default + Sub<Output = Self> {
    fn saturating_add(self, delta: Self) -> Self;
}

impl BalanceValue for Decimal {
    fn saturating_add(self, delta: Self) -> Self { Decimal::saturating_add(self, delta) }
}

impl BalanceValue for i64 {
    fn saturating_add(self, delta: Self) -> Self { i64::saturating_add(self, delta) }
}

impl<T: BalanceValue> BalanceAdjustment<T> {
    pub fn apply(before: T, delta: T) -> Self {
        let raw = before.saturating_add(delta);
        if raw < T::default() {
            Self { before, after: T::default(), clamped: true }
        } else {
            Self { before, after: raw, clamped: false }
        }
    }

    /// Amount that actually moved.
    pub fn applied(&self) -> T { self.after - self.before }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedemptionRejected {
    #[error("coin amount must be positive")]
    InvalidAmount,
    #[error("insufficient coins: requested {requested}, have {available}")]
    InsufficientBalance { requested: i64, available: i64 },
    #[error("{requested} coins exceed the {max} redeemable against this order")]
    ExceedsOrderValue { requested: i64, max: i64 },
}

/// A wallet debit larger than the balance. Nothing was taken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("insufficient wallet balance: need {needed}, have {available}")]
pub struct InsufficientFunds { pub needed: Decimal, pub available: Decimal }

impl Account {
    pub fn open(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(), wallet_balance: Decimal::ZERO, loyalty_coins: 0, total_spent: Decimal::ZERO,
            premium_until: None, created_at: now, updated_at: now,
        }
    }

    pub fn with_wallet(mut self, balance: Decimal) -> Self { self.wallet_balance = balance.max(Decimal::ZERO); self }
    pub fn with_coins(mut self, coins: i64) -> Self { self.loyalty_coins = coins.max(0); self }

    pub fn is_premium_at(&self, now: DateTime<Utc>) -> bool {
        self.premium_until.map_or(false, |until| until > now)
    }

    pub fn adjust_wallet(&mut self, delta: Decimal) -> BalanceAdjustment<Decimal> {
        let adj = BalanceAdjustment::apply(self.wallet_balance, delta);
        self.wallet_balance = adj.after;
        self.touch();
        adj
    }

    pub fn adjust_total_spent(&mut self, delta: Decimal) -> BalanceAdjustment<Decimal> {
        let adj = BalanceAdjustment::apply(self.total_spent, delta);
        self.total_spent = adj.after;
        self.touch();
        adj
    }

    pub fn adjust_coins(&mut self, delta: i64) -> BalanceAdjustment<i64> {
        let adj = BalanceAdjustment::apply(self.loyalty_coins, delta);
        self.loyalty_coins = adj.after;
        self.touch();
        adj
    }

    /// Takes `amount` from the wallet only if it is all there.
    pub fn debit_wallet(&mut self, amount: Decimal) -> Result<BalanceAdjustment<Decimal>, InsufficientFunds> {
        if amount > self.wallet_balance {
            return Err(InsufficientFunds { needed: amount, available: self.wallet_balance });
        }
        Ok(self.adjust_wallet(-amount))
    }

    /// Takes `coins` only if the balance covers them.
    pub fn spend_coins(&mut self, coins: i64) -> Result<BalanceAdjustment<i64>, RedemptionRejected> {
        if coins <= 0 { return Err(RedemptionRejected::InvalidAmount); }
        if coins > self.loyalty_coins {
            return Err(RedemptionRejected::InsufficientBalance { requested: coins, available: self.loyalty_coins });
        }
        Ok(self.adjust_coins(-coins))
    }

    /// Activates premium, or extends it from the current expiry when still active.
    pub fn extend_premium(&mut self, months: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = match self.premium_until {
            Some(until) if until > now => until,
            _ => now,
        };
        let until = base.checked_add_months(Months::new(months)).unwrap_or(base);
        self.premium_until = Some(until);
        self.touch();
        until
    }

    pub fn check_redemption(&self, coins: i64, max_coins: i64) -> Result<(), RedemptionRejected> {
        if coins <= 0 { return Err(RedemptionRejected::InvalidAmount); }
        if coins > self.loyalty_coins {
            return Err(RedemptionRejected::InsufficientBalance { requested: coins, available: self.loyalty_coins });
        }
        if coins > max_coins {
            return Err(RedemptionRejected::ExceedsOrderValue { requested: coins, max: max_coins });
        }
        Ok(())
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}
