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

//! Transaction records.
//!
//! A transaction is created [`Pending`](TransactionStatus::Pending) and moves
//! exactly once:
//!
//! ```text
//! Pending ──atomic success──► Completed
//!    │
//!    └──────any failure─────► Failed
//! ```
//!
//! Completed and failed records are immutable.

use crate::base::{AccountId, TransactionRef};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Fractional digits kept for every amount.
pub const AMOUNT_SCALE: u32 = 4;

/// Metadata key carrying the reason a transaction failed.
pub const FAILURE_REASON_KEY: &str = "failure_reason";

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Payment,
    Refund,
    Withdrawal,
    Deposit,
    QrPayment,
}

impl TransactionType {
    /// Checks which parties this type takes.
    ///
    /// Deposits only credit a receiver, withdrawals only debit a sender,
    /// everything else moves money between two wallets.
    pub fn check_parties(
        &self,
        sender: Option<AccountId>,
        receiver: Option<AccountId>,
    ) -> Result<(), LedgerError> {
        match (self, sender, receiver) {
            (_, None, None) => Err(LedgerError::MissingParty),
            (Self::Deposit, None, Some(_)) => Ok(()),
            (Self::Deposit, _, _) => Err(LedgerError::InvalidParties(
                "deposit takes a receiver only",
            )),
            (Self::Withdrawal, Some(_), None) => Ok(()),
            (Self::Withdrawal, _, _) => Err(LedgerError::InvalidParties(
                "withdrawal takes a sender only",
            )),
            (_, Some(s), Some(r)) if s == r => Err(LedgerError::SameParty),
            (_, Some(_), Some(_)) => Ok(()),
            _ => Err(LedgerError::InvalidParties(
                "transfer types need a sender and a receiver",
            )),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transfer => "transfer",
            Self::Payment => "payment",
            Self::Refund => "refund",
            Self::Withdrawal => "withdrawal",
            Self::Deposit => "deposit",
            Self::QrPayment => "qr_payment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// A money-movement intent handed to the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub sender_id: Option<AccountId>,
    pub receiver_id: Option<AccountId>,
    pub amount: Decimal,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TransactionRequest {
    pub fn transfer(sender: AccountId, receiver: AccountId, amount: Decimal) -> Self {
        Self::new(TransactionType::Transfer, Some(sender), Some(receiver), amount)
    }

    pub fn deposit(receiver: AccountId, amount: Decimal) -> Self {
        Self::new(TransactionType::Deposit, None, Some(receiver), amount)
    }

    pub fn withdrawal(sender: AccountId, amount: Decimal) -> Self {
        Self::new(TransactionType::Withdrawal, Some(sender), None, amount)
    }

    pub fn new(
        kind: TransactionType,
        sender_id: Option<AccountId>,
        receiver_id: Option<AccountId>,
        amount: Decimal,
    ) -> Self {
        Self {
            kind,
            sender_id,
            receiver_id,
            amount,
            description: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sender with `AccountId(0)` folded into `None`.
    pub fn sender(&self) -> Option<AccountId> {
        self.sender_id.filter(|id| !id.is_zero())
    }

    /// Receiver with `AccountId(0)` folded into `None`.
    pub fn receiver(&self) -> Option<AccountId> {
        self.receiver_id.filter(|id| !id.is_zero())
    }

    /// Input checks that need no storage access.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        if self.amount.normalize().scale() > AMOUNT_SCALE {
            return Err(LedgerError::InvalidPrecision(AMOUNT_SCALE));
        }
        self.kind.check_parties(self.sender(), self.receiver())
    }
}

/// A ledger transaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub transaction_ref: TransactionRef,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub sender_id: Option<AccountId>,
    pub receiver_id: Option<AccountId>,
    pub amount: Decimal,
    pub fee: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub qr_code_ref: Option<String>,
    pub description: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Builds a pending transaction from a validated request.
    pub fn pending(
        request: &TransactionRequest,
        currency: &str,
        qr_code_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_ref: TransactionRef::generate(),
            kind: request.kind,
            sender_id: request.sender(),
            receiver_id: request.receiver(),
            amount: request.amount,
            fee: Decimal::ZERO,
            currency: currency.to_string(),
            status: TransactionStatus::Pending,
            qr_code_ref,
            description: request.description.clone(),
            metadata: request.metadata.clone(),
            created_at: now,
            completed_at: None,
        }
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.transition(TransactionStatus::Completed)?;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), LedgerError> {
        self.transition(TransactionStatus::Failed)?;
        self.metadata
            .insert(FAILURE_REASON_KEY.to_string(), reason.to_string());
        Ok(())
    }

    fn transition(&mut self, to: TransactionStatus) -> Result<(), LedgerError> {
        if self.status != TransactionStatus::Pending {
            return Err(LedgerError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }

    /// Whether `account` is sender or receiver.
    pub fn involves(&self, account: AccountId) -> bool {
        self.sender_id == Some(account) || self.receiver_id == Some(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_non_positive_amounts() {
        let zero = TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(0));
        assert_eq!(zero.validate(), Err(LedgerError::InvalidAmount));
        let negative = TransactionRequest::deposit(AccountId(1), dec!(-5));
        assert_eq!(negative.validate(), Err(LedgerError::InvalidAmount));
    }

    #[test]
    fn rejects_excess_precision() {
        let request = TransactionRequest::deposit(AccountId(1), dec!(1.00001));
        assert_eq!(request.validate(), Err(LedgerError::InvalidPrecision(4)));
        let trailing_zeros = TransactionRequest::deposit(AccountId(1), dec!(1.500000));
        assert!(trailing_zeros.validate().is_ok());
    }

    #[test]
    fn zero_accounts_count_as_missing() {
        let request = TransactionRequest::new(
            TransactionType::Transfer,
            Some(AccountId(0)),
            Some(AccountId(0)),
            dec!(1),
        );
        assert_eq!(request.validate(), Err(LedgerError::MissingParty));
    }

    #[test]
    fn same_party_rejected() {
        let request = TransactionRequest::transfer(AccountId(4), AccountId(4), dec!(1));
        assert_eq!(request.validate(), Err(LedgerError::SameParty));
    }

    #[test]
    fn party_shapes_per_type() {
        let deposit_with_sender = TransactionRequest::new(
            TransactionType::Deposit,
            Some(AccountId(1)),
            Some(AccountId(2)),
            dec!(1),
        );
        assert!(matches!(
            deposit_with_sender.validate(),
            Err(LedgerError::InvalidParties(_))
        ));

        let payment_without_receiver =
            TransactionRequest::new(TransactionType::Payment, Some(AccountId(1)), None, dec!(1));
        assert!(matches!(
            payment_without_receiver.validate(),
            Err(LedgerError::InvalidParties(_))
        ));

        assert!(TransactionRequest::withdrawal(AccountId(1), dec!(1)).validate().is_ok());
    }

    #[test]
    fn status_moves_once() {
        let request = TransactionRequest::deposit(AccountId(1), dec!(10));
        let mut tx = Transaction::pending(&request, "USD", None, Utc::now());
        tx.complete(Utc::now()).unwrap();
        assert!(tx.is_completed());
        assert_eq!(
            tx.fail("late"),
            Err(LedgerError::InvalidTransition {
                from: TransactionStatus::Completed,
                to: TransactionStatus::Failed,
            })
        );
    }

    #[test]
    fn failed_records_reason() {
        let request = TransactionRequest::withdrawal(AccountId(1), dec!(10));
        let mut tx = Transaction::pending(&request, "USD", None, Utc::now());
        tx.fail("insufficient balance").unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(
            tx.metadata.get(FAILURE_REASON_KEY).map(String::as_str),
            Some("insufficient balance")
        );
        assert!(tx.complete(Utc::now()).is_err());
    }

    #[test]
    fn type_serializes_snake_case() {
        let json = serde_json::to_string(&TransactionType::QrPayment).unwrap();
        assert_eq!(json, "\"qr_payment\"");
        assert_eq!(TransactionType::QrPayment.to_string(), "qr_payment");
    }
}
