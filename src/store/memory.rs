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

//! In-memory ledger store with row-level locking.
//!
//! Each row keeps two copies of its value:
//!
//! - a *working* copy behind a `parking_lot` mutex, which is the row lock.
//!   A unit holds the mutex from `*_for_update` until commit or rollback and
//!   edits the working copy in place.
//! - a *committed* copy, read by snapshot readers and restored into the
//!   working copy on rollback.
//!
//! Commits run under an exclusive latch that snapshot readers share, so a
//! reader never sees half of a commit.

use super::journal::{TransactionJournal, completed_volume};
use super::{LedgerStore, LedgerUnit, StoreError, StoreResult};
use crate::base::{AccountId, TransactionRef};
use crate::context::OpContext;
use crate::qr::QrCode;
use crate::transaction::Transaction;
use crate::wallet::Wallet;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Longest single wait on a row mutex before re-checking cancellation.
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Lock-wait bound of [`MemoryLedger::new`].
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

type RowGuard<T> = ArcMutexGuard<RawMutex, T>;

struct Row<T> {
    working: Arc<Mutex<T>>,
    committed: RwLock<T>,
}

impl<T: Clone> Row<T> {
    fn new(value: T) -> Arc<Self> {
        Arc::new(Self {
            working: Arc::new(Mutex::new(value.clone())),
            committed: RwLock::new(value),
        })
    }

    fn snapshot(&self) -> T {
        self.committed.read().clone()
    }
}

/// A row locked by a unit.
struct Held<T> {
    row: Arc<Row<T>>,
    guard: RowGuard<T>,
    dirty: bool,
}

impl<T: Clone> Held<T> {
    fn stage(&mut self, value: &T) {
        *self.guard = value.clone();
        self.dirty = true;
    }

    fn publish(&mut self) {
        if self.dirty {
            *self.row.committed.write() = (*self.guard).clone();
        }
    }

    fn restore(&mut self) {
        if self.dirty {
            *self.guard = self.row.snapshot();
            self.dirty = false;
        }
    }
}

fn check_context(ctx: &OpContext) -> StoreResult<()> {
    if ctx.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    if ctx.is_expired() {
        return Err(StoreError::DeadlineExceeded);
    }
    Ok(())
}

/// In-memory [`LedgerStore`].
pub struct MemoryLedger {
    wallets: DashMap<AccountId, Arc<Row<Wallet>>>,
    qr_codes: DashMap<String, Arc<Row<QrCode>>>,
    journal: TransactionJournal,
    commit_latch: RwLock<()>,
    lock_timeout: Duration,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates a store whose row-lock waits give up after `lock_timeout`.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            wallets: DashMap::new(),
            qr_codes: DashMap::new(),
            journal: TransactionJournal::new(),
            commit_latch: RwLock::new(()),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Committed state of every wallet, ordered by owner.
    pub fn wallets(&self) -> Vec<Wallet> {
        let _latch = self.commit_latch.read();
        let mut wallets: Vec<Wallet> = self.wallets.iter().map(|row| row.snapshot()).collect();
        wallets.sort_by_key(|wallet| wallet.owner_id);
        wallets
    }

    /// Sum of all committed wallet balances, saturating at `Decimal::MAX`.
    pub fn total_balance(&self) -> Decimal {
        self.wallets()
            .iter()
            .fold(Decimal::ZERO, |total, wallet| total.saturating_add(wallet.balance))
    }

    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    fn acquire<T>(&self, row: &Row<T>, ctx: &OpContext) -> StoreResult<RowGuard<T>> {
        let give_up = Instant::now() + self.lock_timeout;
        loop {
            check_context(ctx)?;
            let now = Instant::now();
            if now >= give_up {
                return Err(StoreError::LockTimeout);
            }
            let mut until = (now + LOCK_POLL).min(give_up);
            if let Some(deadline) = ctx.deadline() {
                until = until.min(deadline);
            }
            if let Some(guard) = row.working.try_lock_arc_until(until) {
                return Ok(guard);
            }
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for MemoryLedger {
    fn begin<'a>(&'a self, ctx: &OpContext) -> StoreResult<Box<dyn LedgerUnit + 'a>> {
        check_context(ctx)?;
        Ok(Box::new(MemoryUnit::new(self, ctx.clone())))
    }

    fn wallet(&self, owner: AccountId) -> StoreResult<Option<Wallet>> {
        let _latch = self.commit_latch.read();
        Ok(self.wallets.get(&owner).map(|row| row.snapshot()))
    }

    fn qr_code(&self, code: &str) -> StoreResult<Option<QrCode>> {
        let _latch = self.commit_latch.read();
        Ok(self.qr_codes.get(code).map(|row| row.snapshot()))
    }

    fn transaction(&self, reference: &TransactionRef) -> StoreResult<Option<Transaction>> {
        let _latch = self.commit_latch.read();
        Ok(self.journal.get(reference))
    }

    fn transactions_for(&self, account: AccountId) -> StoreResult<Vec<Transaction>> {
        let _latch = self.commit_latch.read();
        Ok(self.journal.for_account(account))
    }
}

struct MemoryUnit<'a> {
    ledger: &'a MemoryLedger,
    ctx: OpContext,
    wallets: HashMap<AccountId, Held<Wallet>>,
    qr_codes: HashMap<String, Held<QrCode>>,
    new_wallets: Vec<Wallet>,
    new_qr_codes: Vec<QrCode>,
    new_transactions: Vec<Transaction>,
    finished: bool,
}

impl<'a> MemoryUnit<'a> {
    fn new(ledger: &'a MemoryLedger, ctx: OpContext) -> Self {
        Self {
            ledger,
            ctx,
            wallets: HashMap::new(),
            qr_codes: HashMap::new(),
            new_wallets: Vec::new(),
            new_qr_codes: Vec::new(),
            new_transactions: Vec::new(),
            finished: false,
        }
    }

    fn lock_row<K, T>(
        &self,
        rows: &DashMap<K, Arc<Row<T>>>,
        key: &K,
        missing: StoreError,
    ) -> StoreResult<Held<T>>
    where
        K: Eq + Hash,
        T: Clone,
    {
        check_context(&self.ctx)?;
        let row = rows
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(missing)?;
        let guard = self.ledger.acquire(&row, &self.ctx)?;
        Ok(Held {
            row,
            guard,
            dirty: false,
        })
    }

    fn wallet_exists(&self, owner: AccountId) -> bool {
        self.ledger.wallets.contains_key(&owner)
            || self.new_wallets.iter().any(|w| w.owner_id == owner)
    }

    fn qr_code_exists(&self, code: &str) -> bool {
        self.ledger.qr_codes.contains_key(code) || self.new_qr_codes.iter().any(|q| q.code == code)
    }

    /// Unique and foreign-key constraints, checked under the commit latch.
    fn check_constraints(&self) -> StoreResult<()> {
        for wallet in &self.new_wallets {
            if self.ledger.wallets.contains_key(&wallet.owner_id) {
                return Err(StoreError::DuplicateWallet(wallet.owner_id));
            }
        }
        for qr in &self.new_qr_codes {
            if self.ledger.qr_codes.contains_key(&qr.code) {
                return Err(StoreError::DuplicateQrCode);
            }
            if !self.wallet_exists(qr.owner_id) {
                return Err(StoreError::MissingReference(format!(
                    "QR code owner {} has no wallet",
                    qr.owner_id
                )));
            }
        }
        for tx in &self.new_transactions {
            if self.ledger.journal.contains(&tx.transaction_ref) {
                return Err(StoreError::DuplicateTransaction(tx.transaction_ref.clone()));
            }
            for party in [tx.sender_id, tx.receiver_id].into_iter().flatten() {
                if !self.wallet_exists(party) {
                    return Err(StoreError::MissingReference(format!(
                        "transaction party {party} has no wallet"
                    )));
                }
            }
            if let Some(code) = &tx.qr_code_ref {
                if !self.qr_code_exists(code) {
                    return Err(StoreError::MissingReference(
                        "transaction references unknown QR code".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn discard(&mut self) {
        for held in self.wallets.values_mut() {
            held.restore();
        }
        for held in self.qr_codes.values_mut() {
            held.restore();
        }
        self.new_wallets.clear();
        self.new_qr_codes.clear();
        self.new_transactions.clear();
    }
}

impl LedgerUnit for MemoryUnit<'_> {
    fn wallet_for_update(&mut self, owner: AccountId) -> StoreResult<Wallet> {
        if let Some(held) = self.wallets.get(&owner) {
            return Ok((*held.guard).clone());
        }
        let held = self.lock_row(&self.ledger.wallets, &owner, StoreError::WalletNotFound(owner))?;
        let wallet = (*held.guard).clone();
        trace!(account = %owner, "wallet row locked");
        self.wallets.insert(owner, held);
        Ok(wallet)
    }

    fn update_wallet(&mut self, wallet: &Wallet) -> StoreResult<()> {
        let held = self
            .wallets
            .get_mut(&wallet.owner_id)
            .ok_or(StoreError::NotLocked)?;
        held.stage(wallet);
        Ok(())
    }

    fn insert_wallet(&mut self, wallet: Wallet) -> StoreResult<()> {
        if self.wallet_exists(wallet.owner_id) {
            return Err(StoreError::DuplicateWallet(wallet.owner_id));
        }
        self.new_wallets.push(wallet);
        Ok(())
    }

    fn qr_code_for_update(&mut self, code: &str) -> StoreResult<QrCode> {
        if let Some(held) = self.qr_codes.get(code) {
            return Ok((*held.guard).clone());
        }
        let key = code.to_string();
        let held = self.lock_row(&self.ledger.qr_codes, &key, StoreError::QrCodeNotFound)?;
        let qr = (*held.guard).clone();
        self.qr_codes.insert(key, held);
        Ok(qr)
    }

    fn update_qr_code(&mut self, qr: &QrCode) -> StoreResult<()> {
        let held = self.qr_codes.get_mut(&qr.code).ok_or(StoreError::NotLocked)?;
        held.stage(qr);
        Ok(())
    }

    fn insert_qr_code(&mut self, qr: QrCode) -> StoreResult<()> {
        if self.qr_code_exists(&qr.code) {
            return Err(StoreError::DuplicateQrCode);
        }
        self.new_qr_codes.push(qr);
        Ok(())
    }

    fn insert_transaction(&mut self, tx: Transaction) -> StoreResult<()> {
        let reference = &tx.transaction_ref;
        if self.ledger.journal.contains(reference)
            || self
                .new_transactions
                .iter()
                .any(|staged| &staged.transaction_ref == reference)
        {
            return Err(StoreError::DuplicateTransaction(reference.clone()));
        }
        self.new_transactions.push(tx);
        Ok(())
    }

    fn qr_volume_since(&self, code: &str, since: DateTime<Utc>) -> StoreResult<Decimal> {
        let staged = completed_volume(self.new_transactions.iter(), since, |tx| {
            tx.qr_code_ref.as_deref() == Some(code)
        });
        Ok(self.ledger.journal.qr_volume_since(code, since) + staged)
    }

    fn outgoing_volume_since(
        &self,
        account: AccountId,
        since: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        let staged = completed_volume(self.new_transactions.iter(), since, |tx| {
            tx.sender_id == Some(account)
        });
        Ok(self.ledger.journal.outgoing_volume_since(account, since) + staged)
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        // An expired or cancelled unit is dropped here, which rolls it back.
        check_context(&self.ctx)?;

        let ledger = self.ledger;
        let _latch = ledger.commit_latch.write();
        self.check_constraints()?;

        for held in self.wallets.values_mut() {
            held.publish();
        }
        for held in self.qr_codes.values_mut() {
            held.publish();
        }
        for wallet in self.new_wallets.drain(..) {
            ledger.wallets.insert(wallet.owner_id, Row::new(wallet));
        }
        for qr in self.new_qr_codes.drain(..) {
            ledger.qr_codes.insert(qr.code.clone(), Row::new(qr));
        }
        let appended = self.new_transactions.len();
        for tx in self.new_transactions.drain(..) {
            ledger.journal.append(tx)?;
        }
        self.finished = true;
        debug!(
            wallets = self.wallets.len(),
            qr_codes = self.qr_codes.len(),
            transactions = appended,
            "unit committed"
        );
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for MemoryUnit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
            trace!("unit rolled back");
        }
    }
}
