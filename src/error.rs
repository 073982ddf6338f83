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

//! Error types for ledger operations.
//!
//! Errors fall into four families, reported by [`LedgerError::kind`]:
//!
//! | Kind | Raised | Retry |
//! |------|--------|-------|
//! | [`ErrorKind::Validation`] | before any storage access | after fixing the input |
//! | [`ErrorKind::StateConflict`] | after a lock/read, nothing applied | after the condition changes |
//! | [`ErrorKind::Compensation`] | a reversing credit failed | never, needs manual reconciliation |
//! | [`ErrorKind::Persistence`] | storage failure, unit rolled back | from scratch |

use crate::base::AccountId;
use crate::store::StoreError;
use crate::transaction::TransactionStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Coarse classification of a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    Compensation,
    Persistence,
    Configuration,
}

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Amount has more fractional digits than the ledger keeps
    #[error("amount has more than {0} decimal places")]
    InvalidPrecision(u32),

    /// Neither sender nor receiver was given
    #[error("transaction has no sender and no receiver")]
    MissingParty,

    /// Parties do not fit the transaction type
    #[error("invalid parties: {0}")]
    InvalidParties(&'static str),

    /// Sender and receiver are the same account
    #[error("sender and receiver must differ")]
    SameParty,

    /// QR code generation request is malformed
    #[error("invalid QR code request: {0}")]
    InvalidQrRequest(&'static str),

    #[error("illegal transaction transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("wallet not found for account {0}")]
    WalletNotFound(AccountId),

    #[error("wallet already exists for account {0}")]
    WalletExists(AccountId),

    #[error("wallet for account {0} is locked")]
    WalletLocked(AccountId),

    #[error("wallet for account {0} is inactive")]
    WalletInactive(AccountId),

    /// Debit would take the balance below zero
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("QR code not found")]
    QrNotFound,

    #[error("QR code is not active")]
    QrInactive,

    #[error("QR code has expired")]
    QrExpired,

    #[error("QR code usage limit reached")]
    QrLimitExceeded,

    /// Redemption amount differs from the fixed QR amount
    #[error("amount mismatch: expected {expected}, got {found}")]
    AmountMismatch { expected: Decimal, found: Decimal },

    /// A daily, monthly or single-transaction limit would be breached
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("risk score {score:.2} exceeds ceiling")]
    RiskTooHigh { score: f64 },

    /// Caller's verified role may not redeem this QR code
    #[error("caller is not allowed to redeem this QR code")]
    UnauthorizedRedeemer,

    #[error("caller does not own this resource")]
    NotOwner,

    #[error("transaction not found")]
    TransactionNotFound,

    /// Reversing credit failed after a debit; money is unaccounted for.
    #[error("compensation failed for account {account} ({amount}): {reason}")]
    CompensationFailed {
        account: AccountId,
        amount: Decimal,
        reason: String,
    },

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount
            | Self::InvalidPrecision(_)
            | Self::MissingParty
            | Self::InvalidParties(_)
            | Self::SameParty
            | Self::InvalidQrRequest(_)
            | Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::CompensationFailed { .. } => ErrorKind::Compensation,
            Self::Storage(_) => ErrorKind::Persistence,
            Self::MissingDependency(_) | Self::Config(_) => ErrorKind::Configuration,
            _ => ErrorKind::StateConflict,
        }
    }

    /// Whether the whole operation may be retried as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_transient())
    }

    /// Whether the error needs manual reconciliation.
    pub fn is_critical(&self) -> bool {
        self.kind() == ErrorKind::Compensation
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WalletNotFound(account) => Self::WalletNotFound(account),
            StoreError::QrCodeNotFound => Self::QrNotFound,
            StoreError::DuplicateWallet(account) => Self::WalletExists(account),
            other => Self::Storage(other),
        }
    }
}
