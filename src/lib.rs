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

//! # Wallet Ledger
//!
//! Ledger core for a digital wallet: per-account balances, peer-to-peer and
//! QR-code payments, and the risk and limit checks in front of them.
//!
//! ## Core Components
//!
//! - [`Ledger`]: Facade built with [`LedgerBuilder`] from an injected store
//! - [`WalletCore`]: The only code that changes a balance
//! - [`TransactionProcessor`]: Atomic debit, credit and record
//! - [`QrEngine`]: Generation and at-most-once redemption of QR codes
//! - [`RiskGate`]: Risk score ceiling and rolling per-sender limits
//! - [`LedgerStore`]: Row-locking storage contract, with [`MemoryLedger`] in memory
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use wallet_ledger::{AccountId, Ledger, MemoryLedger, OpContext, TransactionRequest};
//! use rust_decimal_macros::dec;
//!
//! let ledger = Ledger::builder()
//!     .store(Arc::new(MemoryLedger::new()))
//!     .build()
//!     .unwrap();
//! let ctx = OpContext::background();
//!
//! ledger.open_wallet(&ctx, AccountId(1)).unwrap();
//! ledger.open_wallet(&ctx, AccountId(2)).unwrap();
//! ledger
//!     .process_transaction(&ctx, TransactionRequest::deposit(AccountId(1), dec!(100)))
//!     .unwrap();
//! ledger
//!     .process_transaction(&ctx, TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(30)))
//!     .unwrap();
//!
//! assert_eq!(ledger.get_balance(&ctx, AccountId(1)).unwrap(), dec!(70));
//! assert_eq!(ledger.get_balance(&ctx, AccountId(2)).unwrap(), dec!(30));
//! ```
//!
//! ## Thread Safety
//!
//! Every operation takes `&self`. Wallet and QR rows are locked per unit of
//! work, so operations on unrelated wallets run in parallel.

mod base;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
mod ledger;
pub mod processor;
pub mod qr;
pub mod risk;
pub mod store;
mod transaction;
pub mod wallet;

pub use base::{AccountId, Caller, Role, TransactionRef, WalletId};
pub use cache::BalanceCache;
pub use config::LedgerConfig;
pub use context::{Clock, ManualClock, OpContext, SystemClock};
pub use error::{ErrorKind, LedgerError};
pub use ledger::{Ledger, LedgerBuilder};
pub use processor::TransactionProcessor;
pub use qr::{GenerateCode, QrCode, QrCodeStatus, QrCodeType, QrEngine, RedeemCode};
pub use risk::{AmountRiskPolicy, LimitConfig, RiskGate, RiskPolicy};
pub use store::{LedgerStore, LedgerUnit, MemoryLedger, StoreError, TransactionJournal};
pub use transaction::{
    AMOUNT_SCALE, FAILURE_REASON_KEY, Metadata, Transaction, TransactionRequest,
    TransactionStatus, TransactionType,
};
pub use wallet::{Wallet, WalletCore, WalletStatus};
