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

//! Read-side balance cache.
//!
//! Entries expire after a short TTL and are invalidated, never updated, when
//! a wallet changes. Nothing on a locked mutation path reads this cache.
//!
//! Each account carries a generation that [`BalanceCache::invalidate`] bumps.
//! A reader takes the generation before loading the committed balance and
//! fills with [`BalanceCache::put_if_current`], so a load that raced a write
//! is dropped instead of cached.

use crate::base::AccountId;
use lru::LruCache;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct CacheEntry {
    balance: Decimal,
    inserted_at: Instant,
}

struct Inner {
    entries: LruCache<AccountId, CacheEntry>,
    generations: HashMap<AccountId, u64>,
}

impl Inner {
    fn generation(&self, account: AccountId) -> u64 {
        self.generations.get(&account).copied().unwrap_or(0)
    }

    fn insert(&mut self, account: AccountId, balance: Decimal) {
        self.entries.put(
            account,
            CacheEntry {
                balance,
                inserted_at: Instant::now(),
            },
        );
    }
}

/// In-process LRU cache of committed balances.
pub struct BalanceCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl BalanceCache {
    /// Creates a cache holding at most `capacity` balances for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
                generations: HashMap::new(),
            }),
            ttl,
        }
    }

    /// Returns the cached balance unless missing or expired.
    pub fn get(&self, account: AccountId) -> Option<Decimal> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(&account) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.balance);
            }
            inner.entries.pop(&account);
        }
        None
    }

    /// Current generation of `account`; take it before reading the store.
    pub fn generation(&self, account: AccountId) -> u64 {
        self.inner.lock().generation(account)
    }

    pub fn put(&self, account: AccountId, balance: Decimal) {
        self.inner.lock().insert(account, balance);
    }

    /// Caches `balance` only if `account` was not invalidated since
    /// `generation` was taken. Returns whether the entry was stored.
    pub fn put_if_current(&self, account: AccountId, balance: Decimal, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation(account) != generation {
            return false;
        }
        inner.insert(account, balance);
        true
    }

    pub fn invalidate(&self, account: AccountId) {
        let mut inner = self.inner.lock();
        inner.entries.pop(&account);
        let generation = inner.generations.entry(account).or_insert(0);
        *generation = generation.wrapping_add(1);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn cache_put_and_get() {
        let cache = BalanceCache::new(10, Duration::from_secs(300));
        assert!(cache.get(AccountId(1)).is_none());
        cache.put(AccountId(1), dec!(12.5));
        assert_eq!(cache.get(AccountId(1)), Some(dec!(12.5)));
    }

    #[test]
    fn cache_invalidate() {
        let cache = BalanceCache::new(10, Duration::from_secs(300));
        cache.put(AccountId(1), dec!(1));
        cache.invalidate(AccountId(1));
        assert!(cache.get(AccountId(1)).is_none());
    }

    #[test]
    fn cache_ttl_expiry() {
        let cache = BalanceCache::new(10, Duration::from_millis(1));
        cache.put(AccountId(1), dec!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(AccountId(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn fill_after_invalidate_is_dropped() {
        let cache = BalanceCache::new(10, Duration::from_secs(300));
        let generation = cache.generation(AccountId(1));
        cache.invalidate(AccountId(1));
        assert!(!cache.put_if_current(AccountId(1), dec!(100), generation));
        assert!(cache.get(AccountId(1)).is_none());

        let generation = cache.generation(AccountId(1));
        assert!(cache.put_if_current(AccountId(1), dec!(150), generation));
        assert_eq!(cache.get(AccountId(1)), Some(dec!(150)));
    }

    #[test]
    fn invalidate_is_per_account() {
        let cache = BalanceCache::new(10, Duration::from_secs(300));
        let generation = cache.generation(AccountId(1));
        cache.invalidate(AccountId(2));
        assert!(cache.put_if_current(AccountId(1), dec!(1), generation));
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = BalanceCache::new(2, Duration::from_secs(300));
        cache.put(AccountId(1), dec!(1));
        cache.put(AccountId(2), dec!(2));
        cache.get(AccountId(1));
        cache.put(AccountId(3), dec!(3));
        assert!(cache.get(AccountId(2)).is_none());
        assert_eq!(cache.get(AccountId(1)), Some(dec!(1)));
    }

    #[test]
    fn zero_capacity_still_caches_one() {
        let cache = BalanceCache::new(0, Duration::from_secs(300));
        cache.put(AccountId(1), dec!(1));
        assert_eq!(cache.len(), 1);
    }
}
