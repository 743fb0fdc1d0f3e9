//! Service configuration, read from the environment (and `.env`).

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use crate::services::{LifecycleSettings, LoyaltyRates, RefundMultiplierPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Absent means in-memory storage.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub nats_url: Option<String>,
    pub loyalty: LoyaltyRates,
    pub lifecycle: LifecycleSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = LoyaltyRates::default();
        let lifecycle = LifecycleSettings::default();

        let loyalty = LoyaltyRates {
            xp_per_usd: parse_or(var("LOYALTY_XP_PER_USD"), "LOYALTY_XP_PER_USD", defaults.xp_per_usd)?,
            coins_per_usd: parse_or(var("LOYALTY_COINS_PER_USD"), "LOYALTY_COINS_PER_USD", defaults.coins_per_usd)?,
            coin_value_usd: parse_or(var("LOYALTY_COIN_VALUE_USD"), "LOYALTY_COIN_VALUE_USD", defaults.coin_value_usd)?,
            premium_multiplier: parse_or(
                var("LOYALTY_PREMIUM_MULTIPLIER"),
                "LOYALTY_PREMIUM_MULTIPLIER",
                defaults.premium_multiplier,
            )?,
        };
        validate_rates(&loyalty)?;

        let refund_multiplier = match var("REFUND_MULTIPLIER_POLICY") {
            Some(raw) => RefundMultiplierPolicy::from_str(&raw)
                .map_err(anyhow::Error::msg)
                .context("Invalid REFUND_MULTIPLIER_POLICY")?,
            None => lifecycle.refund_multiplier,
        };

        Ok(Config {
            port: parse_or(var("PORT"), "PORT", 8083)?,
            database_url: var("DATABASE_URL"),
            database_max_connections: parse_or(var("DATABASE_MAX_CONNECTIONS"), "DATABASE_MAX_CONNECTIONS", 10)?,
            nats_url: var("NATS_URL"),
            loyalty,
            lifecycle: LifecycleSettings {
                premium_product_id: var("PREMIUM_PRODUCT_ID").unwrap_or(lifecycle.premium_product_id),
                refund_multiplier,
            },
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| anyhow::anyhow!("Invalid {key} ({raw}): {e}")),
        None => Ok(default),
    }
}

fn validate_rates(rates: &LoyaltyRates) -> Result<()> {
    if rates.xp_per_usd < Decimal::ZERO || rates.coins_per_usd < Decimal::ZERO {
        bail!("loyalty earn rates must not be negative");
    }
    if rates.coin_value_usd <= Decimal::ZERO {
        bail!("LOYALTY_COIN_VALUE_USD must be positive");
    }
    if rates.premium_multiplier < Decimal::ONE {
        bail!("LOYALTY_PREMIUM_MULTIPLIER must be at least 1");
    }
    Ok(())
}
