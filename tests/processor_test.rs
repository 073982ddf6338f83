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

//! Transaction Processor integration tests.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wallet_ledger::{
    AccountId, ErrorKind, FAILURE_REASON_KEY, Ledger, LedgerConfig, LedgerError, LedgerStore,
    LedgerUnit, LimitConfig, ManualClock, MemoryLedger, OpContext, QrCode, RiskPolicy,
    StoreError, Transaction, TransactionRef, TransactionRequest, TransactionStatus,
    TransactionType, Wallet, WalletStatus,
};

type StoreResult<T> = Result<T, StoreError>;

fn ledger_with(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Ledger {
    Ledger::builder().store(store).config(config).build().unwrap()
}

fn setup() -> (Arc<MemoryLedger>, Ledger) {
    let store = Arc::new(MemoryLedger::new());
    let ledger = ledger_with(store.clone(), LedgerConfig::default());
    (store, ledger)
}

fn open(ledger: &Ledger, accounts: &[u64]) {
    for account in accounts {
        ledger
            .open_wallet(&OpContext::background(), AccountId(*account))
            .unwrap();
    }
}

fn deposit(ledger: &Ledger, account: u64, amount: Decimal) -> Transaction {
    ledger
        .process_transaction(
            &OpContext::background(),
            TransactionRequest::deposit(AccountId(account), amount),
        )
        .unwrap()
}

fn balance(ledger: &Ledger, account: u64) -> Decimal {
    ledger.wallet(AccountId(account)).unwrap().balance
}

fn failed_records(ledger: &Ledger, account: u64) -> Vec<Transaction> {
    ledger
        .history(AccountId(account))
        .unwrap()
        .into_iter()
        .filter(|tx| tx.status == TransactionStatus::Failed)
        .collect()
}

// === Scenarios ===

#[test]
fn transfer_moves_funds_and_records_completion() {
    let (_, ledger) = setup();
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(100));

    let tx = ledger
        .process_transaction(
            &OpContext::background(),
            TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(20))
                .with_description("lunch"),
        )
        .unwrap();

    assert_eq!(balance(&ledger, 1), dec!(80));
    assert_eq!(balance(&ledger, 2), dec!(20));
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.kind, TransactionType::Transfer);
    assert_eq!(tx.fee, dec!(0));
    assert_eq!(tx.currency, "USD");
    assert!(tx.completed_at.is_some());
    assert!(tx.transaction_ref.as_str().starts_with("TXN-"));
    assert_eq!(ledger.transaction(&tx.transaction_ref).unwrap(), tx);
}

#[test]
fn insufficient_transfer_leaves_balances_and_writes_failed_record() {
    let (_, ledger) = setup();
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(100));

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(150)),
    );

    assert_eq!(result, Err(LedgerError::InsufficientBalance));
    assert_eq!(balance(&ledger, 1), dec!(100));
    assert_eq!(balance(&ledger, 2), dec!(0));

    let failed = failed_records(&ledger, 1);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].amount, dec!(150));
    assert!(failed[0].completed_at.is_none());
    assert_eq!(
        failed[0].metadata.get(FAILURE_REASON_KEY).map(String::as_str),
        Some("insufficient balance")
    );
}

#[test]
fn deposit_and_withdrawal_shapes() {
    let (store, ledger) = setup();
    open(&ledger, &[1]);
    deposit(&ledger, 1, dec!(70));

    let tx = ledger
        .process_transaction(
            &OpContext::background(),
            TransactionRequest::withdrawal(AccountId(1), dec!(30)),
        )
        .unwrap();

    assert_eq!(tx.sender_id, Some(AccountId(1)));
    assert_eq!(tx.receiver_id, None);
    assert_eq!(balance(&ledger, 1), dec!(40));
    assert_eq!(store.total_balance(), dec!(40));
}

#[test]
fn zero_account_means_no_party() {
    let (_, ledger) = setup();
    open(&ledger, &[1]);
    let request = TransactionRequest::new(
        TransactionType::Deposit,
        Some(AccountId(0)),
        Some(AccountId(1)),
        dec!(5),
    );

    let tx = ledger
        .process_transaction(&OpContext::background(), request)
        .unwrap();

    assert_eq!(tx.sender_id, None);
    assert_eq!(balance(&ledger, 1), dec!(5));
}

#[test]
fn validation_errors_touch_nothing() {
    let (store, ledger) = setup();
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(10));
    let ctx = OpContext::background();

    let cases = [
        (
            TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(0)),
            LedgerError::InvalidAmount,
        ),
        (
            TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(0.00001)),
            LedgerError::InvalidPrecision(4),
        ),
        (
            TransactionRequest::transfer(AccountId(1), AccountId(1), dec!(1)),
            LedgerError::SameParty,
        ),
        (
            TransactionRequest::new(TransactionType::Payment, None, None, dec!(1)),
            LedgerError::MissingParty,
        ),
    ];
    for (request, expected) in cases {
        let err = ledger.process_transaction(&ctx, request).unwrap_err();
        assert_eq!(err, expected);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    assert_eq!(store.journal().len(), 1);
    assert_eq!(balance(&ledger, 1), dec!(10));
}

#[test]
fn missing_receiver_rolls_back_debit() {
    let (_, ledger) = setup();
    open(&ledger, &[1]);
    deposit(&ledger, 1, dec!(50));

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::transfer(AccountId(1), AccountId(404), dec!(20)),
    );

    assert_eq!(result, Err(LedgerError::WalletNotFound(AccountId(404))));
    assert_eq!(balance(&ledger, 1), dec!(50));
    assert!(failed_records(&ledger, 1).is_empty());
}

#[test]
fn locked_receiver_compensates_sender() {
    let (store, ledger) = setup();
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(50));
    ledger
        .set_wallet_status(&OpContext::background(), AccountId(2), WalletStatus::Locked)
        .unwrap();

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(20)),
    );

    assert_eq!(result, Err(LedgerError::WalletLocked(AccountId(2))));
    assert_eq!(balance(&ledger, 1), dec!(50));
    assert_eq!(balance(&ledger, 2), dec!(0));
    assert_eq!(store.total_balance(), dec!(50));
    assert_eq!(failed_records(&ledger, 2).len(), 1);
}

#[test]
fn currency_mismatch_rejected() {
    let store = Arc::new(MemoryLedger::new());
    let usd = ledger_with(store.clone(), LedgerConfig::default());
    let eur = ledger_with(
        store,
        LedgerConfig {
            currency: "EUR".to_string(),
            ..LedgerConfig::default()
        },
    );
    open(&usd, &[1]);

    let result = eur.process_transaction(
        &OpContext::background(),
        TransactionRequest::deposit(AccountId(1), dec!(5)),
    );

    assert_eq!(
        result,
        Err(LedgerError::CurrencyMismatch {
            expected: "EUR".to_string(),
            found: "USD".to_string(),
        })
    );
}

// === Risk and limits ===

#[test]
fn high_risk_rejected_before_any_change() {
    let store = Arc::new(MemoryLedger::new());
    let config = LedgerConfig {
        risk_ceiling: 0.4,
        ..LedgerConfig::default()
    };
    let ledger = ledger_with(store.clone(), config);
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(5000));
    deposit(&ledger, 1, dec!(9000));

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(12000)),
    );

    assert!(matches!(result, Err(LedgerError::RiskTooHigh { .. })));
    assert_eq!(balance(&ledger, 1), dec!(14000));
    assert_eq!(failed_records(&ledger, 1).len(), 1);
}

struct FixedScore(f64);

impl RiskPolicy for FixedScore {
    fn score(&self, _: &Transaction) -> f64 {
        self.0
    }
}

#[test]
fn custom_risk_policy_is_used() {
    let ledger = Ledger::builder()
        .store(Arc::new(MemoryLedger::new()))
        .risk_policy(Arc::new(FixedScore(0.95)))
        .build()
        .unwrap();
    open(&ledger, &[1]);

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::deposit(AccountId(1), dec!(1)),
    );

    assert_eq!(result, Err(LedgerError::RiskTooHigh { score: 0.95 }));
}

#[test]
fn single_transaction_limit() {
    let config = LedgerConfig {
        limits: LimitConfig {
            single_transaction: dec!(100),
            ..LimitConfig::default()
        },
        ..LedgerConfig::default()
    };
    let ledger = ledger_with(Arc::new(MemoryLedger::new()), config);
    open(&ledger, &[1, 2]);
    // Deposits have no sender and are not capped.
    deposit(&ledger, 1, dec!(500));

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(101)),
    );

    assert!(matches!(result, Err(LedgerError::LimitExceeded(_))));
    assert_eq!(balance(&ledger, 1), dec!(500));
}

#[test]
fn daily_limit_rolls_over_after_a_day() {
    let start: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let config = LedgerConfig {
        limits: LimitConfig {
            daily_limit: dec!(100),
            monthly_limit: dec!(150),
            ..LimitConfig::default()
        },
        ..LedgerConfig::default()
    };
    let ledger = Ledger::builder()
        .store(Arc::new(MemoryLedger::new()))
        .clock(clock.clone())
        .config(config)
        .build()
        .unwrap();
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(1000));
    let ctx = OpContext::background();
    let pay = |amount| {
        ledger.process_transaction(
            &ctx,
            TransactionRequest::transfer(AccountId(1), AccountId(2), amount),
        )
    };

    pay(dec!(60)).unwrap();
    assert!(matches!(pay(dec!(50)), Err(LedgerError::LimitExceeded(_))));
    pay(dec!(40)).unwrap();

    clock.advance(Duration::hours(25));
    pay(dec!(40)).unwrap();
    // Monthly total would reach 160.
    assert!(matches!(pay(dec!(20)), Err(LedgerError::LimitExceeded(_))));

    assert_eq!(balance(&ledger, 2), dec!(140));
}

// === Failure injection ===

/// Wraps a store and fails the nth `update_wallet` of one account per unit.
struct FlakyStore {
    inner: MemoryLedger,
    account: AccountId,
    fail_on: usize,
    injected: AtomicUsize,
}

impl FlakyStore {
    fn new(account: AccountId, fail_on: usize) -> Self {
        Self {
            inner: MemoryLedger::new(),
            account,
            fail_on,
            injected: AtomicUsize::new(0),
        }
    }
}

struct FlakyUnit<'a> {
    inner: Box<dyn LedgerUnit + 'a>,
    store: &'a FlakyStore,
    updates: usize,
}

impl LedgerStore for FlakyStore {
    fn begin<'a>(&'a self, ctx: &OpContext) -> StoreResult<Box<dyn LedgerUnit + 'a>> {
        Ok(Box::new(FlakyUnit {
            inner: self.inner.begin(ctx)?,
            store: self,
            updates: 0,
        }))
    }

    fn wallet(&self, owner: AccountId) -> StoreResult<Option<Wallet>> {
        self.inner.wallet(owner)
    }

    fn qr_code(&self, code: &str) -> StoreResult<Option<QrCode>> {
        self.inner.qr_code(code)
    }

    fn transaction(&self, reference: &TransactionRef) -> StoreResult<Option<Transaction>> {
        self.inner.transaction(reference)
    }

    fn transactions_for(&self, account: AccountId) -> StoreResult<Vec<Transaction>> {
        self.inner.transactions_for(account)
    }
}

impl LedgerUnit for FlakyUnit<'_> {
    fn wallet_for_update(&mut self, owner: AccountId) -> StoreResult<Wallet> {
        self.inner.wallet_for_update(owner)
    }

    fn update_wallet(&mut self, wallet: &Wallet) -> StoreResult<()> {
        if wallet.owner_id == self.store.account {
            self.updates += 1;
            if self.updates == self.store.fail_on {
                self.store.injected.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected".to_string()));
            }
        }
        self.inner.update_wallet(wallet)
    }

    fn insert_wallet(&mut self, wallet: Wallet) -> StoreResult<()> {
        self.inner.insert_wallet(wallet)
    }

    fn qr_code_for_update(&mut self, code: &str) -> StoreResult<QrCode> {
        self.inner.qr_code_for_update(code)
    }

    fn update_qr_code(&mut self, qr: &QrCode) -> StoreResult<()> {
        self.inner.update_qr_code(qr)
    }

    fn insert_qr_code(&mut self, qr: QrCode) -> StoreResult<()> {
        self.inner.insert_qr_code(qr)
    }

    fn insert_transaction(&mut self, tx: Transaction) -> StoreResult<()> {
        self.inner.insert_transaction(tx)
    }

    fn qr_volume_since(&self, code: &str, since: DateTime<Utc>) -> StoreResult<Decimal> {
        self.inner.qr_volume_since(code, since)
    }

    fn outgoing_volume_since(
        &self,
        account: AccountId,
        since: DateTime<Utc>,
    ) -> StoreResult<Decimal> {
        self.inner.outgoing_volume_since(account, since)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) {
        self.inner.rollback()
    }
}

#[test]
fn receiver_credit_failure_is_compensated() {
    // Receiver's first update in a unit fails.
    let store = Arc::new(FlakyStore::new(AccountId(2), 1));
    let ledger = ledger_with(store.clone(), LedgerConfig::default());
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(100));
    let injected_before = store.injected.load(Ordering::SeqCst);

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(30)),
    );

    let err = result.unwrap_err();
    assert_eq!(err, LedgerError::Storage(StoreError::Unavailable("injected".into())));
    assert!(err.is_transient());
    assert_eq!(store.injected.load(Ordering::SeqCst), injected_before + 1);
    assert_eq!(balance(&ledger, 1), dec!(100));
    assert_eq!(balance(&ledger, 2), dec!(0));
    assert_eq!(failed_records(&ledger, 1).len(), 1);
}

#[test]
fn failed_compensation_is_critical() {
    // Sender is updated by the debit, then by the reversing credit.
    let store = Arc::new(FlakyStore::new(AccountId(1), 2));
    let ledger = ledger_with(store.clone(), LedgerConfig::default());
    open(&ledger, &[1, 2]);
    deposit(&ledger, 1, dec!(100));
    ledger
        .set_wallet_status(&OpContext::background(), AccountId(2), WalletStatus::Inactive)
        .unwrap();

    let result = ledger.process_transaction(
        &OpContext::background(),
        TransactionRequest::transfer(AccountId(1), AccountId(2), dec!(30)),
    );

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::CompensationFailed { account: AccountId(1), amount, .. } if amount == dec!(30)
    ));
    assert!(err.is_critical());
    assert_eq!(err.kind(), ErrorKind::Compensation);
    // Nothing was committed; the unit's rollback keeps funds in place.
    assert_eq!(balance(&ledger, 1), dec!(100));
    assert_eq!(failed_records(&ledger, 1).len(), 1);
}

// === Conservation ===

#[test]
fn transfers_conserve_total_balance() {
    let (store, ledger) = setup();
    open(&ledger, &[1, 2, 3]);
    deposit(&ledger, 1, dec!(100));
    deposit(&ledger, 2, dec!(50));
    let ctx = OpContext::background();

    let moves = [
        (1, 2, dec!(10)),
        (2, 3, dec!(55)),
        (3, 1, dec!(5.5)),
        (1, 3, dec!(500)),
        (2, 1, dec!(0.0001)),
    ];
    for (from, to, amount) in moves {
        let _ = ledger.process_transaction(
            &ctx,
            TransactionRequest::transfer(AccountId(from), AccountId(to), amount),
        );
        assert_eq!(store.total_balance(), dec!(150));
    }
    for wallet in store.wallets() {
        assert!(wallet.balance >= Decimal::ZERO);
    }
}
