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

//! Ledger Store contract.
//!
//! All mutation goes through a [`LedgerUnit`]: an atomic unit of work that
//! takes exclusive row locks ("read for update"), stages changes, and either
//! commits everything or nothing. Row locks are held until the unit commits
//! or rolls back; dropping an uncommitted unit rolls it back.
//!
//! Reads outside a unit ([`LedgerStore::wallet`] and friends) see committed
//! state only and never wait on row locks.

mod journal;
mod memory;

pub use journal::TransactionJournal;
pub use memory::MemoryLedger;

use crate::base::{AccountId, TransactionRef};
use crate::context::OpContext;
use crate::qr::QrCode;
use crate::transaction::Transaction;
use crate::wallet::Wallet;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Storage-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("no wallet for account {0}")]
    WalletNotFound(AccountId),

    #[error("no such QR code")]
    QrCodeNotFound,

    /// Unique constraint on wallet owner
    #[error("duplicate wallet for account {0}")]
    DuplicateWallet(AccountId),

    /// Unique constraint on QR code
    #[error("duplicate QR code")]
    DuplicateQrCode,

    /// Unique constraint on transaction reference
    #[error("duplicate transaction reference {0}")]
    DuplicateTransaction(TransactionRef),

    /// Foreign key points at a missing row
    #[error("dangling reference: {0}")]
    MissingReference(String),

    /// Write to a row the unit has not locked
    #[error("row not locked by this unit")]
    NotLocked,

    #[error("timed out waiting for row lock")]
    LockTimeout,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout | Self::DeadlineExceeded | Self::Unavailable(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One atomic unit of work.
pub trait LedgerUnit {
    /// Locks the wallet row of `owner` and returns its current contents.
    ///
    /// Locking a row this unit already holds returns the staged contents.
    fn wallet_for_update(&mut self, owner: AccountId) -> StoreResult<Wallet>;

    /// Stages new contents for a wallet row locked by this unit.
    fn update_wallet(&mut self, wallet: &Wallet) -> StoreResult<()>;

    /// Stages a new wallet row. Visible to others only after commit.
    fn insert_wallet(&mut self, wallet: Wallet) -> StoreResult<()>;

    fn qr_code_for_update(&mut self, code: &str) -> StoreResult<QrCode>;

    fn update_qr_code(&mut self, qr: &QrCode) -> StoreResult<()>;

    fn insert_qr_code(&mut self, qr: QrCode) -> StoreResult<()>;

    /// Stages an append to the transaction journal.
    fn insert_transaction(&mut self, tx: Transaction) -> StoreResult<()>;

    /// Sum of completed transactions referencing `code` created at or after `since`,
    /// including ones staged in this unit.
    fn qr_volume_since(&self, code: &str, since: DateTime<Utc>) -> StoreResult<Decimal>;

    /// Sum of completed transactions sent by `account` created at or after `since`,
    /// including ones staged in this unit.
    fn outgoing_volume_since(&self, account: AccountId, since: DateTime<Utc>)
    -> StoreResult<Decimal>;

    /// Checks constraints and publishes every staged change, then releases locks.
    fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discards staged changes and releases locks.
    fn rollback(self: Box<Self>);
}

/// Durable store of wallets, QR codes and the transaction journal.
pub trait LedgerStore: Send + Sync {
    /// Opens an atomic unit bounded by `ctx`.
    fn begin<'a>(&'a self, ctx: &OpContext) -> StoreResult<Box<dyn LedgerUnit + 'a>>;

    fn wallet(&self, owner: AccountId) -> StoreResult<Option<Wallet>>;

    fn qr_code(&self, code: &str) -> StoreResult<Option<QrCode>>;

    fn transaction(&self, reference: &TransactionRef) -> StoreResult<Option<Transaction>>;

    /// Transactions where `account` is sender or receiver, oldest first.
    fn transactions_for(&self, account: AccountId) -> StoreResult<Vec<Transaction>>;
}
