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

//! Public facade wiring the store, Wallet Core, Transaction Processor and QR
//! Engine together.

use crate::base::{AccountId, Caller, TransactionRef};
use crate::cache::BalanceCache;
use crate::config::LedgerConfig;
use crate::context::{Clock, OpContext, SystemClock};
use crate::error::LedgerError;
use crate::processor::TransactionProcessor;
use crate::qr::{GenerateCode, QrCode, QrEngine, RedeemCode};
use crate::risk::{AmountRiskPolicy, RiskGate, RiskPolicy};
use crate::store::LedgerStore;
use crate::transaction::{Transaction, TransactionRequest};
use crate::wallet::{Wallet, WalletCore, WalletStatus};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

/// Wallet ledger entry point.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Ledger {
    config: LedgerConfig,
    wallets: Arc<WalletCore>,
    processor: Arc<TransactionProcessor>,
    qr: QrEngine,
}

impl Ledger {
    pub fn builder() -> LedgerBuilder {
        LedgerBuilder::new()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn wallets(&self) -> &WalletCore {
        &self.wallets
    }

    pub fn processor(&self) -> &TransactionProcessor {
        &self.processor
    }

    pub fn qr(&self) -> &QrEngine {
        &self.qr
    }

    /// See [`TransactionProcessor::process`].
    pub fn process_transaction(
        &self,
        ctx: &OpContext,
        request: TransactionRequest,
    ) -> Result<Transaction, LedgerError> {
        self.processor.process(ctx, request)
    }

    /// See [`QrEngine::generate`].
    pub fn generate_qr_code(
        &self,
        ctx: &OpContext,
        request: GenerateCode,
    ) -> Result<QrCode, LedgerError> {
        self.qr.generate(ctx, request)
    }

    /// See [`QrEngine::redeem`].
    pub fn redeem_qr_code(
        &self,
        ctx: &OpContext,
        request: RedeemCode,
    ) -> Result<Transaction, LedgerError> {
        self.qr.redeem(ctx, request)
    }

    /// Retires `code` if `caller` owns it.
    pub fn deactivate_qr_code(
        &self,
        ctx: &OpContext,
        code: &str,
        caller: &Caller,
    ) -> Result<QrCode, LedgerError> {
        self.qr.deactivate(ctx, code, caller.account_id)
    }

    pub fn qr_code(&self, code: &str) -> Result<QrCode, LedgerError> {
        self.qr.get(code)
    }

    pub fn open_wallet(&self, ctx: &OpContext, owner: AccountId) -> Result<Wallet, LedgerError> {
        self.wallets.open_wallet(ctx, owner)
    }

    pub fn wallet(&self, owner: AccountId) -> Result<Wallet, LedgerError> {
        self.wallets.wallet(owner)
    }

    pub fn get_balance(&self, ctx: &OpContext, account: AccountId) -> Result<Decimal, LedgerError> {
        self.wallets.get_balance(ctx, account)
    }

    pub fn validate_balance(
        &self,
        ctx: &OpContext,
        account: AccountId,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        self.wallets.validate_balance(ctx, account, amount)
    }

    /// Raw credit without a transaction record. Prefer a deposit.
    pub fn credit(
        &self,
        ctx: &OpContext,
        account: AccountId,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        self.wallets.credit(ctx, account, amount)
    }

    /// Raw debit without a transaction record. Prefer a withdrawal.
    pub fn debit(
        &self,
        ctx: &OpContext,
        account: AccountId,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        self.wallets.debit(ctx, account, amount)
    }

    pub fn set_wallet_status(
        &self,
        ctx: &OpContext,
        account: AccountId,
        status: WalletStatus,
    ) -> Result<Wallet, LedgerError> {
        self.wallets.set_status(ctx, account, status)
    }

    pub fn transaction(&self, reference: &TransactionRef) -> Result<Transaction, LedgerError> {
        self.processor.transaction(reference)
    }

    pub fn history(&self, account: AccountId) -> Result<Vec<Transaction>, LedgerError> {
        self.processor.history(account)
    }
}

/// Builds a [`Ledger`] from injected dependencies.
///
/// Only the store is required. The clock defaults to [`SystemClock`], the
/// risk policy to [`AmountRiskPolicy`] with the configured threshold, and the
/// configuration to [`LedgerConfig::default`].
#[derive(Default)]
pub struct LedgerBuilder {
    store: Option<Arc<dyn LedgerStore>>,
    clock: Option<Arc<dyn Clock>>,
    risk_policy: Option<Arc<dyn RiskPolicy>>,
    config: Option<LedgerConfig>,
}

impl LedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn risk_policy(mut self, policy: Arc<dyn RiskPolicy>) -> Self {
        self.risk_policy = Some(policy);
        self
    }

    pub fn config(mut self, config: LedgerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// # Errors
    ///
    /// - [`LedgerError::MissingDependency`] - no store was given.
    /// - [`LedgerError::Config`] - the configuration does not validate.
    pub fn build(self) -> Result<Ledger, LedgerError> {
        let store = self.store.ok_or(LedgerError::MissingDependency("store"))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let policy = self.risk_policy.unwrap_or_else(|| {
            Arc::new(AmountRiskPolicy::new(config.high_value_threshold))
        });

        let cache = Arc::new(BalanceCache::new(config.cache_capacity, config.cache_ttl));
        let wallets = Arc::new(WalletCore::new(
            store.clone(),
            cache,
            clock.clone(),
            &config.currency,
        ));
        let gate = Arc::new(RiskGate::new(
            policy,
            config.risk_ceiling,
            config.limits.clone(),
        ));
        let processor = Arc::new(TransactionProcessor::new(
            store.clone(),
            wallets.clone(),
            gate,
            clock.clone(),
        ));
        let qr = QrEngine::new(store, wallets.clone(), processor.clone(), clock);

        info!(
            currency = %config.currency,
            risk_ceiling = config.risk_ceiling,
            daily_limit = %config.limits.daily_limit,
            monthly_limit = %config.limits.monthly_limit,
            "ledger ready"
        );
        Ok(Ledger {
            config,
            wallets,
            processor,
            qr,
        })
    }
}
