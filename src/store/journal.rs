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

//! Append-only transaction journal with duplicate detection.
//!
//! Records are keyed by [`TransactionRef`] and indexed by participating
//! account and by QR code, preserving append order in each index.

use super::{StoreError, StoreResult};
use crate::base::{AccountId, TransactionRef};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Thread-safe append-only journal.
///
/// Uses a [`DashMap`] entry check for O(1) rejection of duplicate references.
#[derive(Debug, Default)]
pub struct TransactionJournal {
    /// Records by reference, for duplicate detection and lookup.
    transactions: DashMap<TransactionRef, Arc<Transaction>>,

    /// Records per sender/receiver, in append order.
    by_account: DashMap<AccountId, Vec<Arc<Transaction>>>,

    /// Records per redeemed QR code, in append order.
    by_qr_code: DashMap<String, Vec<Arc<Transaction>>>,
}

impl TransactionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateTransaction`] if the reference is taken.
    pub fn append(&self, transaction: Transaction) -> StoreResult<()> {
        let transaction = Arc::new(transaction);

        // Entry API keeps check-and-insert atomic.
        match self
            .transactions
            .entry(transaction.transaction_ref.clone())
        {
            Entry::Occupied(entry) => Err(StoreError::DuplicateTransaction(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&transaction));
                for account in [transaction.sender_id, transaction.receiver_id]
                    .into_iter()
                    .flatten()
                {
                    self.by_account
                        .entry(account)
                        .or_default()
                        .push(Arc::clone(&transaction));
                }
                if let Some(code) = &transaction.qr_code_ref {
                    self.by_qr_code
                        .entry(code.clone())
                        .or_default()
                        .push(Arc::clone(&transaction));
                }
                Ok(())
            }
        }
    }

    pub fn contains(&self, reference: &TransactionRef) -> bool {
        self.transactions.contains_key(reference)
    }

    pub fn get(&self, reference: &TransactionRef) -> Option<Transaction> {
        self.transactions
            .get(reference)
            .map(|entry| entry.value().as_ref().clone())
    }

    pub fn for_account(&self, account: AccountId) -> Vec<Transaction> {
        self.by_account
            .get(&account)
            .map(|entries| entries.iter().map(|tx| tx.as_ref().clone()).collect())
            .unwrap_or_default()
    }

    pub fn qr_volume_since(&self, code: &str, since: DateTime<Utc>) -> Decimal {
        self.by_qr_code
            .get(code)
            .map(|entries| completed_volume(entries.iter().map(Arc::as_ref), since, |_| true))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn outgoing_volume_since(&self, account: AccountId, since: DateTime<Utc>) -> Decimal {
        self.by_account
            .get(&account)
            .map(|entries| {
                completed_volume(entries.iter().map(Arc::as_ref), since, |tx| {
                    tx.sender_id == Some(account)
                })
            })
            .unwrap_or(Decimal::ZERO)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// Sums completed transactions created at or after `since` that pass `filter`.
///
/// Saturates at `Decimal::MAX`.
pub(crate) fn completed_volume<'a, I, F>(transactions: I, since: DateTime<Utc>, filter: F) -> Decimal
where
    I: Iterator<Item = &'a Transaction>,
    F: Fn(&Transaction) -> bool,
{
    transactions
        .filter(|tx| tx.is_completed() && tx.created_at >= since && filter(tx))
        .fold(Decimal::ZERO, |total, tx| total.saturating_add(tx.amount))
}
