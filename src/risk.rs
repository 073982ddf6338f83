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

//! Risk and limit gate.
//!
//! Two checks guard every money movement:
//!
//! - [`RiskGate::assess`] runs before any storage access. It enforces the
//!   single-transaction limit and compares the [`RiskPolicy`] score to the
//!   configured ceiling.
//! - [`RiskGate::check_limits`] runs inside the atomic unit after the sender
//!   row is locked, so concurrent payments from one sender are checked one at
//!   a time against the rolling daily and monthly totals.

use crate::base::AccountId;
use crate::error::LedgerError;
use crate::store::LedgerUnit;
use crate::transaction::Transaction;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Start of the rolling daily window ending at `now`.
pub fn daily_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(24)
}

/// Start of the rolling monthly window ending at `now`.
pub fn monthly_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(30)
}

/// Scores a proposed transaction between 0 (harmless) and 1 (certain fraud).
///
/// Policies never block by themselves; the gate compares the score to its
/// ceiling.
pub trait RiskPolicy: Send + Sync {
    fn score(&self, transaction: &Transaction) -> f64;
}

/// Scores by amount magnitude alone.
///
/// Amounts above the threshold score 0.5, above five times the threshold 0.9.
#[derive(Debug, Clone)]
pub struct AmountRiskPolicy {
    high_value_threshold: Decimal,
}

impl AmountRiskPolicy {
    const HIGH_VALUE_WEIGHT: f64 = 0.5;
    const VERY_HIGH_VALUE_WEIGHT: f64 = 0.4;
    const VERY_HIGH_VALUE_FACTOR: i64 = 5;

    pub fn new(high_value_threshold: Decimal) -> Self {
        Self {
            high_value_threshold,
        }
    }
}

impl Default for AmountRiskPolicy {
    fn default() -> Self {
        Self::new(Decimal::from(10_000))
    }
}

impl RiskPolicy for AmountRiskPolicy {
    fn score(&self, transaction: &Transaction) -> f64 {
        let mut score = 0.0;
        if transaction.amount > self.high_value_threshold {
            score += Self::HIGH_VALUE_WEIGHT;
        }
        // A threshold too large to scale leaves nothing above it.
        let very_high = self
            .high_value_threshold
            .checked_mul(Decimal::from(Self::VERY_HIGH_VALUE_FACTOR));
        if very_high.is_some_and(|very_high| transaction.amount > very_high) {
            score += Self::VERY_HIGH_VALUE_WEIGHT;
        }
        score
    }
}

/// True when `used + amount` is above `limit` or does not fit in a `Decimal`.
pub(crate) fn exceeds(used: Decimal, amount: Decimal, limit: Decimal) -> bool {
    used.checked_add(amount).is_none_or(|total| total > limit)
}

/// Per-sender spending limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Largest single outgoing amount
    pub single_transaction: Decimal,

    /// Rolling 24 hour outgoing total
    pub daily_limit: Decimal,

    /// Rolling 30 day outgoing total
    pub monthly_limit: Decimal,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            single_transaction: Decimal::from(1_000_000),
            daily_limit: Decimal::from(100_000),
            monthly_limit: Decimal::from(1_000_000),
        }
    }
}

impl LimitConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.single_transaction <= Decimal::ZERO
            || self.daily_limit <= Decimal::ZERO
            || self.monthly_limit <= Decimal::ZERO
        {
            return Err(LedgerError::Config("limits must be positive".into()));
        }
        if self.daily_limit > self.monthly_limit {
            return Err(LedgerError::Config(
                "daily limit cannot exceed monthly limit".into(),
            ));
        }
        Ok(())
    }
}

/// Pre-commit risk and limit checks.
pub struct RiskGate {
    policy: Arc<dyn RiskPolicy>,
    ceiling: f64,
    limits: LimitConfig,
}

impl RiskGate {
    pub fn new(policy: Arc<dyn RiskPolicy>, ceiling: f64, limits: LimitConfig) -> Self {
        Self {
            policy,
            ceiling,
            limits,
        }
    }

    pub fn limits(&self) -> &LimitConfig {
        &self.limits
    }

    /// Scores `transaction` and rejects it above the ceiling.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LimitExceeded`] - amount above the single-transaction limit
    ///   (outgoing transactions only).
    /// - [`LedgerError::RiskTooHigh`] - score above the ceiling.
    pub fn assess(&self, transaction: &Transaction) -> Result<f64, LedgerError> {
        if transaction.sender_id.is_some() && transaction.amount > self.limits.single_transaction {
            return Err(LedgerError::LimitExceeded(format!(
                "amount {} exceeds single transaction limit {}",
                transaction.amount, self.limits.single_transaction
            )));
        }
        let score = self.policy.score(transaction).clamp(0.0, 1.0);
        if score > self.ceiling {
            warn!(
                reference = %transaction.transaction_ref,
                amount = %transaction.amount,
                score,
                "transaction rejected by risk gate"
            );
            return Err(LedgerError::RiskTooHigh { score });
        }
        Ok(score)
    }

    /// Checks the rolling outgoing totals of `sender` with `amount` added.
    ///
    /// Call with the sender row locked in `unit`.
    pub fn check_limits(
        &self,
        unit: &(dyn LedgerUnit + '_),
        sender: AccountId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let daily = unit.outgoing_volume_since(sender, daily_window_start(now))?;
        if exceeds(daily, amount, self.limits.daily_limit) {
            return Err(LedgerError::LimitExceeded(format!(
                "daily limit {} for account {sender}",
                self.limits.daily_limit
            )));
        }
        let monthly = unit.outgoing_volume_since(sender, monthly_window_start(now))?;
        if exceeds(monthly, amount, self.limits.monthly_limit) {
            return Err(LedgerError::LimitExceeded(format!(
                "monthly limit {} for account {sender}",
                self.limits.monthly_limit
            )));
        }
        Ok(())
    }
}
