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

//! Transaction processing.
//!
//! The [`TransactionProcessor`] is the single authority that turns a
//! money-movement intent into a durable state change.
//!
//! # Processing
//!
//! 1. Validate the request. No storage access happens before this passes.
//! 2. Score it with the [`RiskGate`].
//! 3. In one atomic unit: debit the sender, check the sender's rolling
//!    limits, credit the receiver, append the completed record.
//! 4. Commit. Either the balances and the record become durable together,
//!    or nothing does.
//!
//! If the receiver credit fails after the sender debit, the sender is
//! credited back inside the unit before it is aborted. A failed reversal is
//! reported as [`LedgerError::CompensationFailed`] and logged at error level.
//!
//! # Failure records
//!
//! Once a request passes validation, any failure rolls the unit back and a
//! `failed` copy of the transaction is appended in a separate unit as an
//! audit entry. Failures caused by a missing wallet or QR code are not
//! recorded, since the record could not reference them.

use crate::base::{AccountId, TransactionRef};
use crate::context::{Clock, OpContext};
use crate::error::{ErrorKind, LedgerError};
use crate::risk::RiskGate;
use crate::store::{LedgerStore, LedgerUnit};
use crate::transaction::{Transaction, TransactionRequest};
use crate::wallet::WalletCore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Moves money between wallets atomically.
///
/// # Invariants
///
/// - Debit is applied before credit, inside the same unit.
/// - The sum of all balances changes only by deposits and withdrawals.
/// - Only `completed` records count toward rolling limits.
pub struct TransactionProcessor {
    store: Arc<dyn LedgerStore>,
    wallets: Arc<WalletCore>,
    gate: Arc<RiskGate>,
    clock: Arc<dyn Clock>,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallets: Arc<WalletCore>,
        gate: Arc<RiskGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            wallets,
            gate,
            clock,
        }
    }

    /// Processes a transaction request.
    ///
    /// | Type | Sender | Receiver |
    /// |------|--------|----------|
    /// | Deposit | - | credited |
    /// | Withdrawal | debited | - |
    /// | Transfer, Payment, Refund, QrPayment | debited | credited |
    ///
    /// # Errors
    ///
    /// - Validation errors ([`LedgerError::InvalidAmount`], [`LedgerError::MissingParty`], ...).
    /// - [`LedgerError::RiskTooHigh`] / [`LedgerError::LimitExceeded`] - rejected by the gate.
    /// - [`LedgerError::InsufficientBalance`] - sender cannot cover the amount.
    /// - [`LedgerError::WalletNotFound`], [`LedgerError::WalletLocked`], [`LedgerError::WalletInactive`].
    /// - [`LedgerError::CompensationFailed`] - critical, see module docs.
    /// - [`LedgerError::Storage`] - transient, nothing was committed.
    pub fn process(
        &self,
        ctx: &OpContext,
        request: TransactionRequest,
    ) -> Result<Transaction, LedgerError> {
        let transaction = self.prepare(&request, None)?;

        let result = self.gate.assess(&transaction).and_then(|score| {
            debug!(reference = %transaction.transaction_ref, score, "risk assessed");
            let mut unit = self.store.begin(ctx)?;
            let completed = self.settle(unit.as_mut(), &transaction)?;
            unit.commit()?;
            Ok(completed)
        });

        self.finish(&transaction, result)
    }

    /// Validates `request` and builds its pending transaction.
    pub fn prepare(
        &self,
        request: &TransactionRequest,
        qr_code_ref: Option<String>,
    ) -> Result<Transaction, LedgerError> {
        request.validate()?;
        Ok(Transaction::pending(
            request,
            self.wallets.currency(),
            qr_code_ref,
            self.clock.now(),
        ))
    }

    /// Risk check plus settlement inside a caller-owned unit.
    ///
    /// The caller commits the unit and then calls [`finish`](Self::finish).
    pub fn process_in(
        &self,
        unit: &mut (dyn LedgerUnit + '_),
        transaction: &Transaction,
    ) -> Result<Transaction, LedgerError> {
        self.gate.assess(transaction)?;
        self.settle(unit, transaction)
    }

    /// Post-commit bookkeeping: cache invalidation on success, failure
    /// record and logging otherwise.
    pub fn finish(
        &self,
        transaction: &Transaction,
        result: Result<Transaction, LedgerError>,
    ) -> Result<Transaction, LedgerError> {
        match result {
            Ok(completed) => {
                for account in parties(&completed) {
                    self.wallets.invalidate(account);
                }
                info!(
                    reference = %completed.transaction_ref,
                    kind = %completed.kind,
                    amount = %completed.amount,
                    sender = ?completed.sender_id,
                    receiver = ?completed.receiver_id,
                    "transaction completed"
                );
                Ok(completed)
            }
            Err(err) => {
                warn!(
                    reference = %transaction.transaction_ref,
                    kind = %transaction.kind,
                    error = %err,
                    "transaction failed"
                );
                self.record_failure(transaction, &err);
                Err(err)
            }
        }
    }

    /// Looks up a transaction by reference.
    pub fn transaction(&self, reference: &TransactionRef) -> Result<Transaction, LedgerError> {
        self.store
            .transaction(reference)?
            .ok_or(LedgerError::TransactionNotFound)
    }

    /// Transactions involving `account`, oldest first.
    pub fn history(&self, account: AccountId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.store.transactions_for(account)?)
    }

    fn settle(
        &self,
        unit: &mut (dyn LedgerUnit + '_),
        transaction: &Transaction,
    ) -> Result<Transaction, LedgerError> {
        let amount = transaction.amount;

        if let Some(sender) = transaction.sender_id {
            self.wallets.debit_in(unit, sender, amount)?;
            // Sender row is locked now; concurrent spends of this sender queue here.
            self.gate
                .check_limits(unit, sender, amount, self.clock.now())?;
        }

        if let Some(receiver) = transaction.receiver_id {
            if let Err(err) = self.wallets.credit_in(unit, receiver, amount) {
                if let Some(sender) = transaction.sender_id {
                    self.compensate(unit, transaction, sender, &err)?;
                }
                return Err(err);
            }
        }

        let mut completed = transaction.clone();
        completed.complete(self.clock.now())?;
        unit.insert_transaction(completed.clone())?;
        Ok(completed)
    }

    /// Credits the debited sender back after the receiver credit failed.
    fn compensate(
        &self,
        unit: &mut (dyn LedgerUnit + '_),
        transaction: &Transaction,
        sender: AccountId,
        cause: &LedgerError,
    ) -> Result<(), LedgerError> {
        match self.wallets.credit_in(unit, sender, transaction.amount) {
            Ok(_) => {
                warn!(
                    reference = %transaction.transaction_ref,
                    account = %sender,
                    amount = %transaction.amount,
                    cause = %cause,
                    "receiver credit failed, sender compensated"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    critical = true,
                    reference = %transaction.transaction_ref,
                    account = %sender,
                    amount = %transaction.amount,
                    cause = %cause,
                    error = %err,
                    "compensation failed, manual reconciliation required"
                );
                Err(LedgerError::CompensationFailed {
                    account: sender,
                    amount: transaction.amount,
                    reason: format!("{err} (after receiver credit failed: {cause})"),
                })
            }
        }
    }

    fn record_failure(&self, transaction: &Transaction, err: &LedgerError) {
        if err.kind() == ErrorKind::Validation
            || matches!(
                err,
                LedgerError::WalletNotFound(_) | LedgerError::QrNotFound
            )
        {
            return;
        }
        let mut failed = transaction.clone();
        if failed.fail(&err.to_string()).is_err() {
            return;
        }

        // The caller's context may be what failed; the audit append takes no row locks.
        let outcome = self
            .store
            .begin(&OpContext::background())
            .map_err(LedgerError::from)
            .and_then(|mut unit| {
                unit.insert_transaction(failed)?;
                unit.commit()?;
                Ok(())
            });
        if let Err(record_err) = outcome {
            warn!(
                reference = %transaction.transaction_ref,
                error = %record_err,
                "could not record failed transaction"
            );
        }
    }
}

fn parties(transaction: &Transaction) -> impl Iterator<Item = AccountId> {
    [transaction.sender_id, transaction.receiver_id]
        .into_iter()
        .flatten()
}
