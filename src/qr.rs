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

//! QR payment codes.
//!
//! A [`QrCode`] is a redeemable token for a payment intent. Redemption runs
//! entirely inside one atomic unit:
//!
//! 1. lock the code row,
//! 2. check status, expiry and usage bound,
//! 3. check the fixed amount and the code's rolling daily/monthly totals,
//! 4. resolve payer and payee from the code type and the caller's verified role,
//! 5. count the use (expiring the code when its bound is reached),
//! 6. hand the fund movement to the [`TransactionProcessor`],
//!
//! then commit. A crash or failure anywhere leaves both the usage counter and
//! the balances untouched.
//!
//! # Direction
//!
//! | Type | Payer | Payee | Redeemer role |
//! |------|-------|-------|---------------|
//! | `receive`, `static`, `dynamic` | redeemer | owner | any |
//! | `payment_code` | owner | redeemer | merchant |

use crate::base::{AccountId, Caller, Role};
use crate::context::{Clock, OpContext};
use crate::error::LedgerError;
use crate::processor::TransactionProcessor;
use crate::risk::{daily_window_start, exceeds, monthly_window_start};
use crate::store::{LedgerStore, LedgerUnit, StoreError};
use crate::transaction::{
    AMOUNT_SCALE, Metadata, Transaction, TransactionRequest, TransactionType,
};
use crate::wallet::WalletCore;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// `max_uses` value meaning "no bound".
pub const UNLIMITED_USES: i64 = -1;

/// Random bytes per code (256 bits).
const CODE_BYTES: usize = 32;

/// Attempts before giving up on a colliding code.
const GENERATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QrCodeType {
    /// Long-lived code to receive money.
    Receive,
    /// Owner's code a merchant scans to charge the owner.
    PaymentCode,
    /// One-off request for a fixed amount.
    Dynamic,
    /// Printed code, optionally with a fixed amount.
    Static,
}

impl QrCodeType {
    fn default_max_uses(&self) -> i64 {
        match self {
            Self::Dynamic => 1,
            Self::Receive | Self::PaymentCode | Self::Static => UNLIMITED_USES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrCodeStatus {
    Active,
    Expired,
}

/// A persisted payment code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrCode {
    pub code: String,
    pub owner_id: AccountId,
    #[serde(rename = "type")]
    pub kind: QrCodeType,
    pub amount: Option<Decimal>,
    pub status: QrCodeStatus,
    pub max_uses: i64,
    pub usage_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QrCode {
    pub fn is_unlimited(&self) -> bool {
        self.max_uses == UNLIMITED_USES
    }

    pub fn is_exhausted(&self) -> bool {
        !self.is_unlimited() && self.usage_count >= self.max_uses
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Status, expiry and usage checks, in that order.
    pub fn check_redeemable(&self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status != QrCodeStatus::Active {
            return Err(LedgerError::QrInactive);
        }
        if self.is_expired_at(now) {
            return Err(LedgerError::QrExpired);
        }
        if self.is_exhausted() {
            return Err(LedgerError::QrLimitExceeded);
        }
        Ok(())
    }

    /// Resolves `(payer, payee)` for a redemption by `redeemer`.
    pub fn parties_for(&self, redeemer: &Caller) -> Result<(AccountId, AccountId), LedgerError> {
        match self.kind {
            QrCodeType::PaymentCode => {
                if redeemer.role != Role::Merchant {
                    return Err(LedgerError::UnauthorizedRedeemer);
                }
                Ok((self.owner_id, redeemer.account_id))
            }
            QrCodeType::Receive | QrCodeType::Static | QrCodeType::Dynamic => {
                Ok((redeemer.account_id, self.owner_id))
            }
        }
    }

    fn record_use(&mut self, now: DateTime<Utc>) {
        self.usage_count += 1;
        if self.is_exhausted() {
            self.status = QrCodeStatus::Expired;
        }
        self.updated_at = now;
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        self.status = QrCodeStatus::Expired;
        self.updated_at = now;
    }

    /// Short prefix safe to log; the full code is a bearer token.
    pub fn log_id(&self) -> &str {
        log_id(&self.code)
    }
}

fn log_id(code: &str) -> &str {
    code.get(..8).unwrap_or(code)
}

/// 256 random bits, URL-safe base64 without padding.
pub fn generate_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Parameters for a new QR code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateCode {
    pub owner_id: AccountId,
    #[serde(rename = "type")]
    pub kind: QrCodeType,
    #[serde(default)]
    pub amount: Option<Decimal>,
    /// Defaults to 1 for dynamic codes, unlimited otherwise.
    #[serde(default)]
    pub max_uses: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub daily_limit: Option<Decimal>,
    #[serde(default)]
    pub monthly_limit: Option<Decimal>,
}

impl GenerateCode {
    pub fn new(owner_id: AccountId, kind: QrCodeType) -> Self {
        Self {
            owner_id,
            kind,
            amount: None,
            max_uses: None,
            expires_at: None,
            daily_limit: None,
            monthly_limit: None,
        }
    }

    pub fn amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn max_uses(mut self, max_uses: i64) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn daily_limit(mut self, limit: Decimal) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn monthly_limit(mut self, limit: Decimal) -> Self {
        self.monthly_limit = Some(limit);
        self
    }

    fn validate(&self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.owner_id.is_zero() {
            return Err(LedgerError::MissingParty);
        }
        for value in [self.amount, self.daily_limit, self.monthly_limit]
            .into_iter()
            .flatten()
        {
            if value <= Decimal::ZERO {
                return Err(LedgerError::InvalidAmount);
            }
            if value.normalize().scale() > AMOUNT_SCALE {
                return Err(LedgerError::InvalidPrecision(AMOUNT_SCALE));
            }
        }
        if self.kind == QrCodeType::Dynamic && self.amount.is_none() {
            return Err(LedgerError::InvalidQrRequest("dynamic codes need an amount"));
        }
        if let Some(max_uses) = self.max_uses {
            if max_uses != UNLIMITED_USES && max_uses < 1 {
                return Err(LedgerError::InvalidQrRequest(
                    "max uses must be -1 or at least 1",
                ));
            }
        }
        if self.expires_at.is_some_and(|at| at <= now) {
            return Err(LedgerError::InvalidQrRequest("expiry must be in the future"));
        }
        if let (Some(daily), Some(monthly)) = (self.daily_limit, self.monthly_limit) {
            if daily > monthly {
                return Err(LedgerError::InvalidQrRequest(
                    "daily limit cannot exceed monthly limit",
                ));
            }
        }
        Ok(())
    }
}

/// A redemption attempt by an authenticated caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeemCode {
    pub code: String,
    pub amount: Decimal,
    pub redeemer: Caller,
    pub description: Option<String>,
    pub metadata: Metadata,
}

impl RedeemCode {
    pub fn new(code: impl Into<String>, amount: Decimal, redeemer: Caller) -> Self {
        Self {
            code: code.into(),
            amount,
            redeemer,
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
}

/// Generates, redeems and retires QR codes.
pub struct QrEngine {
    store: Arc<dyn LedgerStore>,
    wallets: Arc<WalletCore>,
    processor: Arc<TransactionProcessor>,
    clock: Arc<dyn Clock>,
}

impl QrEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        wallets: Arc<WalletCore>,
        processor: Arc<TransactionProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            wallets,
            processor,
            clock,
        }
    }

    /// Creates an active code for `request.owner_id`.
    ///
    /// Opens the owner's wallet if it does not exist yet.
    pub fn generate(&self, ctx: &OpContext, request: GenerateCode) -> Result<QrCode, LedgerError> {
        let now = self.clock.now();
        request.validate(now)?;
        self.wallets.ensure_wallet(ctx, request.owner_id)?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let qr = QrCode {
                code: generate_code(),
                owner_id: request.owner_id,
                kind: request.kind,
                amount: request.amount,
                status: QrCodeStatus::Active,
                max_uses: request.max_uses.unwrap_or(request.kind.default_max_uses()),
                usage_count: 0,
                expires_at: request.expires_at,
                daily_limit: request.daily_limit,
                monthly_limit: request.monthly_limit,
                created_at: now,
                updated_at: now,
            };
            let mut unit = self.store.begin(ctx)?;
            let inserted = unit
                .insert_qr_code(qr.clone())
                .and_then(|()| unit.commit());
            match inserted {
                Ok(()) => {
                    info!(
                        code = qr.log_id(),
                        owner = %qr.owner_id,
                        kind = ?qr.kind,
                        max_uses = qr.max_uses,
                        "QR code generated"
                    );
                    return Ok(qr);
                }
                Err(StoreError::DuplicateQrCode) if attempts < GENERATE_ATTEMPTS => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Redeems `request.code` and moves the funds.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::QrNotFound`], [`LedgerError::QrInactive`], [`LedgerError::QrExpired`],
    ///   [`LedgerError::QrLimitExceeded`] - code cannot be used. A code found past its
    ///   expiry is marked `expired` first.
    /// - [`LedgerError::AmountMismatch`] - code has a different fixed amount.
    /// - [`LedgerError::LimitExceeded`] - code's daily or monthly total would be breached.
    /// - [`LedgerError::UnauthorizedRedeemer`] - payment code scanned by a non-merchant.
    /// - Any error of [`TransactionProcessor::process`].
    pub fn redeem(&self, ctx: &OpContext, request: RedeemCode) -> Result<Transaction, LedgerError> {
        let result = self.try_redeem(ctx, &request);
        if let Err(err) = &result {
            debug!(
                code = log_id(&request.code),
                redeemer = %request.redeemer.account_id,
                error = %err,
                "QR redemption rejected"
            );
        }
        result
    }

    fn try_redeem(&self, ctx: &OpContext, request: &RedeemCode) -> Result<Transaction, LedgerError> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }

        let mut unit = self.store.begin(ctx)?;
        let mut qr = unit.qr_code_for_update(&request.code)?;
        let now = self.clock.now();

        if let Err(err) = qr.check_redeemable(now) {
            if err == LedgerError::QrExpired {
                qr.expire(now);
                unit.update_qr_code(&qr)?;
                unit.commit()?;
                info!(code = qr.log_id(), "QR code expired");
            }
            return Err(err);
        }
        if let Some(fixed) = qr.amount {
            if fixed != request.amount {
                return Err(LedgerError::AmountMismatch {
                    expected: fixed,
                    found: request.amount,
                });
            }
        }
        self.check_code_limits(unit.as_ref(), &qr, request.amount, now)?;

        let (payer, payee) = qr.parties_for(&request.redeemer)?;
        qr.record_use(now);
        unit.update_qr_code(&qr)?;

        let transaction_request = TransactionRequest {
            kind: TransactionType::QrPayment,
            sender_id: Some(payer),
            receiver_id: Some(payee),
            amount: request.amount,
            description: request.description.clone(),
            metadata: request.metadata.clone(),
        };
        let transaction = self
            .processor
            .prepare(&transaction_request, Some(qr.code.clone()))?;

        let settled = self.processor.process_in(unit.as_mut(), &transaction);
        let result = match settled {
            Ok(completed) => unit
                .commit()
                .map(|()| completed)
                .map_err(LedgerError::from),
            Err(err) => {
                unit.rollback();
                Err(err)
            }
        };
        let completed = self.processor.finish(&transaction, result)?;

        info!(
            code = qr.log_id(),
            reference = %completed.transaction_ref,
            usage_count = qr.usage_count,
            status = ?qr.status,
            "QR code redeemed"
        );
        Ok(completed)
    }

    fn check_code_limits(
        &self,
        unit: &(dyn LedgerUnit + '_),
        qr: &QrCode,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if let Some(limit) = qr.daily_limit {
            let used = unit.qr_volume_since(&qr.code, daily_window_start(now))?;
            if exceeds(used, amount, limit) {
                return Err(LedgerError::LimitExceeded(format!(
                    "QR code daily limit {limit}"
                )));
            }
        }
        if let Some(limit) = qr.monthly_limit {
            let used = unit.qr_volume_since(&qr.code, monthly_window_start(now))?;
            if exceeds(used, amount, limit) {
                return Err(LedgerError::LimitExceeded(format!(
                    "QR code monthly limit {limit}"
                )));
            }
        }
        Ok(())
    }

    /// Retires a code at its owner's request.
    pub fn deactivate(
        &self,
        ctx: &OpContext,
        code: &str,
        owner: AccountId,
    ) -> Result<QrCode, LedgerError> {
        let mut unit = self.store.begin(ctx)?;
        let mut qr = unit.qr_code_for_update(code)?;
        if qr.owner_id != owner {
            return Err(LedgerError::NotOwner);
        }
        qr.expire(self.clock.now());
        unit.update_qr_code(&qr)?;
        unit.commit()?;
        info!(code = qr.log_id(), owner = %owner, "QR code deactivated");
        Ok(qr)
    }

    /// Committed state of a code, reported `expired` once past `expires_at`
    /// even if nobody has scanned it since.
    pub fn get(&self, code: &str) -> Result<QrCode, LedgerError> {
        let mut qr = self.store.qr_code(code)?.ok_or(LedgerError::QrNotFound)?;
        if qr.status == QrCodeStatus::Active && qr.is_expired_at(self.clock.now()) {
            qr.status = QrCodeStatus::Expired;
        }
        Ok(qr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn code(kind: QrCodeType, max_uses: i64) -> QrCode {
        let now = Utc::now();
        QrCode {
            code: generate_code(),
            owner_id: AccountId(1),
            kind,
            amount: None,
            status: QrCodeStatus::Active,
            max_uses,
            usage_count: 0,
            expires_at: None,
            daily_limit: None,
            monthly_limit: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn generated_codes_are_url_safe_and_long() {
        let code = generate_code();
        assert_eq!(code.len(), 43);
        assert!(
            code.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(code, generate_code());
    }

    #[test]
    fn bounded_code_expires_when_used_up() {
        let mut qr = code(QrCodeType::Dynamic, 2);
        qr.record_use(Utc::now());
        assert_eq!(qr.status, QrCodeStatus::Active);
        qr.record_use(Utc::now());
        assert_eq!(qr.status, QrCodeStatus::Expired);
        assert_eq!(qr.check_redeemable(Utc::now()), Err(LedgerError::QrInactive));
    }

    #[test]
    fn unlimited_code_never_exhausts() {
        let mut qr = code(QrCodeType::Receive, UNLIMITED_USES);
        for _ in 0..100 {
            qr.record_use(Utc::now());
        }
        assert_eq!(qr.status, QrCodeStatus::Active);
        assert!(qr.check_redeemable(Utc::now()).is_ok());
    }

    #[test]
    fn checks_run_in_order() {
        let now = Utc::now();
        let mut qr = code(QrCodeType::Static, 1);
        qr.usage_count = 1;
        qr.expires_at = Some(now - Duration::minutes(1));
        assert_eq!(qr.check_redeemable(now), Err(LedgerError::QrExpired));
        qr.expires_at = None;
        assert_eq!(qr.check_redeemable(now), Err(LedgerError::QrLimitExceeded));
    }

    #[test]
    fn direction_follows_type_and_role() {
        let receive = code(QrCodeType::Receive, UNLIMITED_USES);
        assert_eq!(
            receive.parties_for(&Caller::user(AccountId(2))),
            Ok((AccountId(2), AccountId(1)))
        );
        assert_eq!(
            receive.parties_for(&Caller::merchant(AccountId(3))),
            Ok((AccountId(3), AccountId(1)))
        );

        let payment = code(QrCodeType::PaymentCode, UNLIMITED_USES);
        assert_eq!(
            payment.parties_for(&Caller::merchant(AccountId(3))),
            Ok((AccountId(1), AccountId(3)))
        );
        assert_eq!(
            payment.parties_for(&Caller::user(AccountId(2))),
            Err(LedgerError::UnauthorizedRedeemer)
        );
    }

    #[test]
    fn generate_request_validation() {
        let now = Utc::now();
        assert_eq!(
            GenerateCode::new(AccountId(1), QrCodeType::Dynamic).validate(now),
            Err(LedgerError::InvalidQrRequest("dynamic codes need an amount"))
        );
        assert_eq!(
            GenerateCode::new(AccountId(1), QrCodeType::Dynamic)
                .amount(dec!(0))
                .validate(now),
            Err(LedgerError::InvalidAmount)
        );
        assert!(matches!(
            GenerateCode::new(AccountId(1), QrCodeType::Receive)
                .max_uses(0)
                .validate(now),
            Err(LedgerError::InvalidQrRequest(_))
        ));
        assert!(matches!(
            GenerateCode::new(AccountId(1), QrCodeType::Receive)
                .expires_at(now - Duration::seconds(1))
                .validate(now),
            Err(LedgerError::InvalidQrRequest(_))
        ));
        assert!(
            GenerateCode::new(AccountId(1), QrCodeType::Static)
                .amount(dec!(12.5))
                .max_uses(UNLIMITED_USES)
                .daily_limit(dec!(100))
                .monthly_limit(dec!(1000))
                .validate(now)
                .is_ok()
        );
    }

    #[test]
    fn default_max_uses_by_type() {
        assert_eq!(QrCodeType::Dynamic.default_max_uses(), 1);
        assert_eq!(QrCodeType::Receive.default_max_uses(), UNLIMITED_USES);
        assert_eq!(QrCodeType::PaymentCode.default_max_uses(), UNLIMITED_USES);
    }
}
