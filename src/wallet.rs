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

//! Wallets and the Wallet Core.
//!
//! A [`Wallet`] is the per-account balance row. [`WalletCore`] is the only
//! code that changes a balance: every credit and debit locks the row inside
//! an atomic unit, checks it, writes it back and, after commit, invalidates
//! the cached balance.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rust_decimal_macros::dec;
//! use wallet_ledger::{AccountId, BalanceCache, MemoryLedger, OpContext, SystemClock, WalletCore};
//!
//! let core = WalletCore::new(
//!     Arc::new(MemoryLedger::new()),
//!     Arc::new(BalanceCache::new(16, std::time::Duration::from_secs(60))),
//!     Arc::new(SystemClock),
//!     "USD",
//! );
//! let ctx = OpContext::background();
//! core.open_wallet(&ctx, AccountId(1)).unwrap();
//! core.credit(&ctx, AccountId(1), dec!(10)).unwrap();
//! assert_eq!(core.get_balance(&ctx, AccountId(1)).unwrap(), dec!(10));
//! ```

use crate::base::{AccountId, WalletId};
use crate::cache::BalanceCache;
use crate::context::{Clock, OpContext};
use crate::error::LedgerError;
use crate::store::{LedgerStore, LedgerUnit, StoreError};
use crate::transaction::AMOUNT_SCALE;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Active,
    /// Frozen, e.g. pending review. Rejects credits and debits.
    Locked,
    /// Closed. Rejects credits and debits.
    Inactive,
}

/// Per-account balance record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub owner_id: AccountId,
    pub balance: Decimal,
    pub currency: String,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(owner_id: AccountId, currency: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: WalletId::new(),
            owner_id,
            balance: Decimal::ZERO,
            currency: currency.to_string(),
            status: WalletStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= Decimal::ZERO,
            "Invariant violated: balance went negative: {}",
            self.balance
        );
    }

    fn ensure_usable(&self) -> Result<(), LedgerError> {
        match self.status {
            WalletStatus::Active => Ok(()),
            WalletStatus::Locked => Err(LedgerError::WalletLocked(self.owner_id)),
            WalletStatus::Inactive => Err(LedgerError::WalletInactive(self.owner_id)),
        }
    }

    /// Increases the balance.
    fn credit(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        self.ensure_usable()?;
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::InvalidAmount)?;
        self.updated_at = now;
        self.assert_invariants();
        Ok(())
    }

    /// Decreases the balance; never below zero.
    fn debit(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        self.ensure_usable()?;
        if self.balance < amount {
            return Err(LedgerError::InsufficientBalance);
        }
        self.balance -= amount;
        self.updated_at = now;
        self.assert_invariants();
        Ok(())
    }
}

impl Serialize for Wallet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Wallet", 7)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("owner_id", &self.owner_id)?;
        state.serialize_field("balance", &self.balance.round_dp(AMOUNT_SCALE))?;
        state.serialize_field("currency", &self.currency)?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("created_at", &self.created_at)?;
        state.serialize_field("updated_at", &self.updated_at)?;
        state.end()
    }
}

/// Atomic credit/debit/balance operations over the ledger store.
pub struct WalletCore {
    store: Arc<dyn LedgerStore>,
    cache: Arc<BalanceCache>,
    clock: Arc<dyn Clock>,
    currency: String,
}

impl WalletCore {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Arc<BalanceCache>,
        clock: Arc<dyn Clock>,
        currency: &str,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            currency: currency.to_string(),
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Creates the wallet of `owner`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::WalletExists`] if the owner already has one.
    pub fn open_wallet(&self, ctx: &OpContext, owner: AccountId) -> Result<Wallet, LedgerError> {
        let wallet = Wallet::new(owner, &self.currency, self.clock.now());
        let mut unit = self.store.begin(ctx)?;
        unit.insert_wallet(wallet.clone())?;
        unit.commit()?;
        info!(account = %owner, wallet = %wallet.id, "wallet opened");
        Ok(wallet)
    }

    /// Returns the wallet of `owner`, opening one on first need.
    pub fn ensure_wallet(
        &self,
        ctx: &OpContext,
        owner: AccountId,
    ) -> Result<Wallet, LedgerError> {
        if let Some(wallet) = self.store.wallet(owner)? {
            return Ok(wallet);
        }
        match self.open_wallet(ctx, owner) {
            // Lost a race with another opener.
            Err(LedgerError::WalletExists(_)) => self
                .store
                .wallet(owner)?
                .ok_or(LedgerError::WalletNotFound(owner)),
            other => other,
        }
    }

    /// Committed wallet of `owner`.
    pub fn wallet(&self, owner: AccountId) -> Result<Wallet, LedgerError> {
        self.store
            .wallet(owner)?
            .ok_or(LedgerError::WalletNotFound(owner))
    }

    /// Current balance, possibly from the cache.
    ///
    /// The value is advisory; debits re-check the locked row.
    pub fn get_balance(
        &self,
        ctx: &OpContext,
        account: AccountId,
    ) -> Result<Decimal, LedgerError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Cancelled.into());
        }
        if let Some(balance) = self.cache.get(account) {
            return Ok(balance);
        }
        let generation = self.cache.generation(account);
        let balance = self.wallet(account)?.balance;
        self.cache.put_if_current(account, balance, generation);
        Ok(balance)
    }

    /// Read-only pre-check that `account` could cover `amount` right now.
    pub fn validate_balance(
        &self,
        ctx: &OpContext,
        account: AccountId,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        if self.get_balance(ctx, account)? < amount {
            return Err(LedgerError::InsufficientBalance);
        }
        Ok(())
    }

    /// Adds `amount` to the wallet of `account` in its own atomic unit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - `amount <= 0`.
    /// - [`LedgerError::WalletNotFound`] - no wallet for `account`.
    /// - [`LedgerError::WalletLocked`] / [`LedgerError::WalletInactive`] - wallet not active.
    pub fn credit(
        &self,
        ctx: &OpContext,
        account: AccountId,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        let mut unit = self.store.begin(ctx)?;
        self.credit_in(unit.as_mut(), account, amount)?;
        unit.commit()?;
        self.invalidate(account);
        debug!(account = %account, %amount, "credited");
        Ok(())
    }

    /// Subtracts `amount` from the wallet of `account` in its own atomic unit.
    ///
    /// # Errors
    ///
    /// As [`credit`](Self::credit), plus [`LedgerError::InsufficientBalance`].
    pub fn debit(
        &self,
        ctx: &OpContext,
        account: AccountId,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        let mut unit = self.store.begin(ctx)?;
        self.debit_in(unit.as_mut(), account, amount)?;
        unit.commit()?;
        self.invalidate(account);
        debug!(account = %account, %amount, "debited");
        Ok(())
    }

    /// Credit inside a caller-owned unit. The caller must call
    /// [`invalidate`](Self::invalidate) after committing.
    pub fn credit_in(
        &self,
        unit: &mut (dyn LedgerUnit + '_),
        account: AccountId,
        amount: Decimal,
    ) -> Result<Wallet, LedgerError> {
        let mut wallet = unit.wallet_for_update(account)?;
        self.check_currency(&wallet)?;
        wallet.credit(amount, self.clock.now())?;
        unit.update_wallet(&wallet)?;
        Ok(wallet)
    }

    /// Debit inside a caller-owned unit. The caller must call
    /// [`invalidate`](Self::invalidate) after committing.
    pub fn debit_in(
        &self,
        unit: &mut (dyn LedgerUnit + '_),
        account: AccountId,
        amount: Decimal,
    ) -> Result<Wallet, LedgerError> {
        let mut wallet = unit.wallet_for_update(account)?;
        self.check_currency(&wallet)?;
        wallet.debit(amount, self.clock.now())?;
        unit.update_wallet(&wallet)?;
        Ok(wallet)
    }

    /// Changes the status of the wallet of `account`.
    pub fn set_status(
        &self,
        ctx: &OpContext,
        account: AccountId,
        status: WalletStatus,
    ) -> Result<Wallet, LedgerError> {
        let mut unit = self.store.begin(ctx)?;
        let mut wallet = unit.wallet_for_update(account)?;
        let previous = wallet.status;
        wallet.status = status;
        wallet.updated_at = self.clock.now();
        unit.update_wallet(&wallet)?;
        unit.commit()?;
        self.invalidate(account);
        if previous != status {
            warn!(account = %account, from = ?previous, to = ?status, "wallet status changed");
        }
        Ok(wallet)
    }

    fn check_currency(&self, wallet: &Wallet) -> Result<(), LedgerError> {
        if wallet.currency != self.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: self.currency.clone(),
                found: wallet.currency.clone(),
            });
        }
        Ok(())
    }

    pub fn invalidate(&self, account: AccountId) {
        self.cache.invalidate(account);
    }
}
