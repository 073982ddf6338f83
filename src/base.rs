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

//! Core identifier types for accounts, wallets and transactions.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of an account owned by the external identity provider.
///
/// `AccountId(0)` is never a real account; transaction requests treat it as
/// "no party".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl AccountId {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a wallet row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct WalletId(pub Uuid);

impl WalletId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WalletId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally visible, globally unique transaction reference.
///
/// Formatted as `TXN-` followed by 32 uppercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TransactionRef(pub String);

impl TransactionRef {
    pub fn generate() -> Self {
        Self(format!("TXN-{}", Uuid::new_v4().simple()).to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of an authenticated caller, as verified by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Merchant,
    Admin,
}

/// An authenticated caller.
///
/// The ledger trusts both fields as given; they must come from verified
/// identity, never from free-form request metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Caller {
    pub account_id: AccountId,
    pub role: Role,
}

impl Caller {
    pub fn new(account_id: AccountId, role: Role) -> Self {
        Self { account_id, role }
    }

    pub fn user(account_id: AccountId) -> Self {
        Self::new(account_id, Role::User)
    }

    pub fn merchant(account_id: AccountId) -> Self {
        Self::new(account_id, Role::Merchant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ref_format() {
        let reference = TransactionRef::generate();
        assert!(reference.as_str().starts_with("TXN-"));
        assert_eq!(reference.as_str().len(), 36);
        assert!(
            reference.as_str()[4..]
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        );
    }

    #[test]
    fn transaction_refs_are_unique() {
        assert_ne!(TransactionRef::generate(), TransactionRef::generate());
    }

    #[test]
    fn zero_account_is_no_party() {
        assert!(AccountId(0).is_zero());
        assert!(!AccountId(7).is_zero());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Merchant).unwrap();
        assert_eq!(json, "\"merchant\"");
    }
}
