//! Loyalty accrual: XP and Valhalla coins earned from cash spent.

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::aggregates::{Account, AccrualRecord, BalanceAdjustment, RedemptionRejected};
use crate::ports::AccountDirectory;
use crate::{Result, StorefrontError};

/// Exchange rates of the loyalty programme.
#[derive(Clone, Debug, PartialEq)]
pub struct LoyaltyRates {
    pub xp_per_usd: Decimal,
    pub coins_per_usd: Decimal,
    /// USD a single coin is worth when redeemed against a cart.
    pub coin_value_usd: Decimal,
    /// Applied to XP only, while premium is active.
    pub premium_multiplier: Decimal,
}

impl Default for LoyaltyRates {
    fn default() -> Self {
        Self {
            xp_per_usd: Decimal::new(10, 0),
            coins_per_usd: Decimal::ONE,
            coin_value_usd: Decimal::new(1, 2),
            premium_multiplier: Decimal::new(15, 1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Redemption { pub coins: i64, pub value_usd: Decimal }

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reversal {
    pub xp: BalanceAdjustment<Decimal>,
    pub coins: BalanceAdjustment<i64>,
}

impl Reversal {
    pub fn clamped(&self) -> bool { self.xp.clamped || self.coins.clamped }
}

pub struct LoyaltyAccrual {
    accounts: Arc<dyn AccountDirectory>,
    rates: LoyaltyRates,
}

impl LoyaltyAccrual {
    pub fn new(accounts: Arc<dyn AccountDirectory>, rates: LoyaltyRates) -> Self {
        Self { accounts, rates }
    }

    pub fn rates(&self) -> &LoyaltyRates { &self.rates }

    pub fn multiplier_for(&self, account: &Account) -> Decimal {
        if account.is_premium_at(Utc::now()) { self.rates.premium_multiplier } else { Decimal::ONE }
    }

    /// Multiplier from the account's premium status right now.
    pub async fn current_multiplier(&self, account_id: &str) -> Result<Decimal> {
        let account = self.accounts.account(account_id).await?;
        Ok(self.multiplier_for(&account))
    }

    pub fn xp_for(&self, cash_usd: Decimal, multiplier: Decimal) -> Result<Decimal> {
        cash_usd.checked_mul(self.rates.xp_per_usd)
            .and_then(|xp| xp.checked_mul(multiplier))
            .ok_or_else(|| out_of_range(cash_usd))
    }

    pub fn coins_for(&self, cash_usd: Decimal) -> Result<i64> {
        cash_usd.checked_mul(self.rates.coins_per_usd)
            .and_then(|coins| coins.floor().to_i64())
            .ok_or_else(|| out_of_range(cash_usd))
    }

    /// XP and coins `cash_usd` earns at `multiplier`.
    pub fn accrual_for(&self, cash_usd: Decimal, multiplier: Decimal) -> Result<(Decimal, i64)> {
        Ok((self.xp_for(cash_usd, multiplier)?, self.coins_for(cash_usd)?))
    }

    pub fn coin_value(&self, coins: i64) -> Result<Decimal> {
        self.value_of(coins)
            .ok_or_else(|| StorefrontError::InvalidInput(format!("{coins} coins are out of range")))
    }

    fn value_of(&self, coins: i64) -> Option<Decimal> {
        Decimal::from(coins).checked_mul(self.rates.coin_value_usd)
    }

    /// Most coins the account may spend against `amount_usd`.
    pub fn max_redeemable(&self, account: &Account, amount_usd: Decimal) -> i64 {
        self.max_by_value(amount_usd).min(account.loyalty_coins)
    }

    /// Pure redemption check; nothing is deducted.
    pub fn check_redemption(
        &self, account: &Account, coins: i64, redeemable_against: Decimal,
    ) -> std::result::Result<Redemption, RedemptionRejected> {
        let max = self.max_by_value(redeemable_against);
        account.check_redemption(coins, max)?;
        let value_usd = self.value_of(coins).ok_or(RedemptionRejected::ExceedsOrderValue { requested: coins, max })?;
        Ok(Redemption { coins, value_usd })
    }

    fn max_by_value(&self, amount_usd: Decimal) -> i64 {
        if self.rates.coin_value_usd <= Decimal::ZERO || amount_usd <= Decimal::ZERO {
            return 0;
        }
        // Past i64 the balance is always the tighter bound.
        amount_usd.checked_div(self.rates.coin_value_usd)
            .and_then(|coins| coins.floor().to_i64())
            .unwrap_or(i64::MAX)
    }

    /// Validates and immediately deducts the coins. The deduction is refused
    /// if the balance dropped below `coins` since it was checked.
    pub async fn redeem(&self, account_id: &str, coins: i64, redeemable_against: Decimal) -> Result<Redemption> {
        let account = self.accounts.account(account_id).await?;
        let redemption = self.check_redemption(&account, coins, redeemable_against)?;
        self.accounts.spend_coins(account_id, coins).await?;
        info!(account_id, coins, value_usd = %redemption.value_usd, "loyalty coins redeemed");
        Ok(redemption)
    }

    /// Gives back coins redeemed on a refunded order.
    pub async fn restore(&self, account_id: &str, coins: i64) -> Result<BalanceAdjustment<i64>> {
        let adj = self.accounts.update_loyalty_coins(account_id, coins).await?;
        info!(account_id, coins, "redeemed loyalty coins restored");
        Ok(adj)
    }

    /// Credits XP and coins for `cash_usd`. Nothing happens for zero or
    /// negative amounts.
    pub async fn accrue(&self, account_id: &str, cash_usd: Decimal, multiplier: Decimal) -> Result<Option<AccrualRecord>> {
        if cash_usd <= Decimal::ZERO {
            debug!(account_id, %cash_usd, "no loyalty accrual for non-positive spend");
            return Ok(None);
        }
        let (xp, coins) = self.accrual_for(cash_usd, multiplier)?;
        self.accounts.update_total_spent(account_id, xp).await?;
        if coins > 0 {
            self.accounts.update_loyalty_coins(account_id, coins).await?;
        }
        info!(account_id, %xp, coins, %multiplier, "loyalty accrued");
        Ok(Some(AccrualRecord { xp, coins, multiplier }))
    }

    /// Takes back what [`accrue`](Self::accrue) credited for the same inputs.
    pub async fn reverse(&self, account_id: &str, cash_usd: Decimal, multiplier: Decimal) -> Result<Option<Reversal>> {
        if cash_usd <= Decimal::ZERO {
            return Ok(None);
        }
        let (xp, coins) = self.accrual_for(cash_usd, multiplier)?;
        let xp = self.accounts.update_total_spent(account_id, -xp).await?;
        let coins = self.accounts.update_loyalty_coins(account_id, -coins).await?;
        let reversal = Reversal { xp, coins };
        if reversal.clamped() {
            warn!(account_id, %cash_usd, "loyalty reversal clamped at zero");
        }
        info!(account_id, xp = %xp.applied(), coins = coins.applied(), "loyalty reversed");
        Ok(Some(reversal))
    }
}

fn out_of_range(cash_usd: Decimal) -> StorefrontError {
    StorefrontError::InvalidInput(format!("loyalty for {cash_usd} USD is out of range"))
}
