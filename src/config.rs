// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # Ledger Configuration
//!
//! [`LedgerConfig`] carries every tunable of the ledger core. Defaults are
//! usable as-is; [`LedgerConfig::from_env`] overrides them from the
//! environment.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `LEDGER_CURRENCY` | Currency of newly opened wallets | `USD` |
//! | `LEDGER_RISK_CEILING` | Reject when risk score is above this | `0.8` |
//! | `LEDGER_HIGH_VALUE_THRESHOLD` | Amount above which risk rises | `10000` |
//! | `LEDGER_SINGLE_TX_LIMIT` | Largest single debit | `1000000` |
//! | `LEDGER_DAILY_LIMIT` | Rolling 24h outgoing limit per sender | `100000` |
//! | `LEDGER_MONTHLY_LIMIT` | Rolling 30d outgoing limit per sender | `1000000` |
//! | `LEDGER_CACHE_TTL_SECS` | Balance cache entry lifetime | `180` |
//! | `LEDGER_CACHE_CAPACITY` | Balance cache entries | `10000` |
//! | `LEDGER_LOCK_TIMEOUT_MS` | Longest wait for a row lock | `2000` |
//!
//! `LEDGER_LOCK_TIMEOUT_MS` configures the store, which is built by the
//! caller; see [`LedgerConfig::lock_timeout`].

use crate::error::LedgerError;
use crate::risk::LimitConfig;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const CURRENCY_ENV: &str = "LEDGER_CURRENCY";
pub const RISK_CEILING_ENV: &str = "LEDGER_RISK_CEILING";
pub const HIGH_VALUE_THRESHOLD_ENV: &str = "LEDGER_HIGH_VALUE_THRESHOLD";
pub const SINGLE_TX_LIMIT_ENV: &str = "LEDGER_SINGLE_TX_LIMIT";
pub const DAILY_LIMIT_ENV: &str = "LEDGER_DAILY_LIMIT";
pub const MONTHLY_LIMIT_ENV: &str = "LEDGER_MONTHLY_LIMIT";
pub const CACHE_TTL_ENV: &str = "LEDGER_CACHE_TTL_SECS";
pub const CACHE_CAPACITY_ENV: &str = "LEDGER_CACHE_CAPACITY";
pub const LOCK_TIMEOUT_ENV: &str = "LEDGER_LOCK_TIMEOUT_MS";

/// Runtime configuration for the ledger core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub currency: String,
    pub risk_ceiling: f64,
    pub high_value_threshold: Decimal,
    pub limits: LimitConfig,
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Row lock wait for the store. The store is injected, so the ledger
    /// builder does not apply this; pass it to
    /// [`MemoryLedger::with_lock_timeout`](crate::MemoryLedger::with_lock_timeout)
    /// when constructing the store.
    #[serde(with = "duration_millis")]
    pub lock_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            risk_ceiling: 0.8,
            high_value_threshold: Decimal::from(10_000),
            limits: LimitConfig::default(),
            cache_ttl: Duration::from_secs(180),
            cache_capacity: 10_000,
            lock_timeout: Duration::from_millis(2_000),
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by any `LEDGER_*` variable that is set.
    pub fn from_env() -> Result<Self, LedgerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LedgerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(currency) = lookup(CURRENCY_ENV) {
            config.currency = currency.trim().to_uppercase();
        }
        if let Some(v) = parse(&lookup, RISK_CEILING_ENV)? {
            config.risk_ceiling = v;
        }
        if let Some(v) = parse(&lookup, HIGH_VALUE_THRESHOLD_ENV)? {
            config.high_value_threshold = v;
        }
        if let Some(v) = parse(&lookup, SINGLE_TX_LIMIT_ENV)? {
            config.limits.single_transaction = v;
        }
        if let Some(v) = parse(&lookup, DAILY_LIMIT_ENV)? {
            config.limits.daily_limit = v;
        }
        if let Some(v) = parse(&lookup, MONTHLY_LIMIT_ENV)? {
            config.limits.monthly_limit = v;
        }
        if let Some(v) = parse::<u64, _>(&lookup, CACHE_TTL_ENV)? {
            config.cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, CACHE_CAPACITY_ENV)? {
            config.cache_capacity = v;
        }
        if let Some(v) = parse::<u64, _>(&lookup, LOCK_TIMEOUT_ENV)? {
            config.lock_timeout = Duration::from_millis(v);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.currency.is_empty() {
            return Err(LedgerError::Config("currency must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.risk_ceiling) {
            return Err(LedgerError::Config(
                "risk ceiling must be within [0, 1]".into(),
            ));
        }
        if self.high_value_threshold <= Decimal::ZERO {
            return Err(LedgerError::Config(
                "high value threshold must be positive".into(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(LedgerError::Config("lock timeout must be non-zero".into()));
        }
        self.limits.validate()
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, LedgerError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LedgerError::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
