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

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};
use wallet_ledger::{
    AccountId, Caller, GenerateCode, Ledger, LedgerConfig, LedgerError, MemoryLedger, OpContext,
    QrCodeType, RedeemCode, TransactionRequest, Wallet, WalletStatus,
};

/// Wallet Ledger - Replay a CSV of ledger commands
///
/// Applies each command in order against a fresh in-memory ledger and writes
/// the final wallet states to stdout. Logs go to stderr (`RUST_LOG`,
/// `LOG_FORMAT=json|pretty`).
#[derive(Parser, Debug)]
#[command(name = "wallet-ledger")]
#[command(about = "Replays wallet ledger commands from a CSV file", long_about = None)]
struct Args {
    /// Path to CSV file with commands
    ///
    /// Expected format: op,account,counterparty,amount,label
    /// Example: cargo run -- commands.csv > wallets.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let config = match LedgerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(2);
        }
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %args.input.display(), error = %e, "cannot open input");
            process::exit(1);
        }
    };

    let mut replay = match Replay::new(config) {
        Ok(replay) => replay,
        Err(e) => {
            error!(error = %e, "cannot build ledger");
            process::exit(2);
        }
    };

    if let Err(e) = process_commands(BufReader::new(file), &mut replay) {
        error!(error = %e, "cannot read commands");
        process::exit(1);
    }

    if let Err(e) = write_wallets(&replay.wallets(), std::io::stdout()) {
        error!(error = %e, "cannot write output");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };
    // A global subscriber may already be installed, e.g. under a test harness.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, account, counterparty, amount, label`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    account: u64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    counterparty: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default)]
    label: Option<String>,
}

/// A replayable ledger command.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Open(AccountId),
    Deposit(AccountId, Decimal),
    Withdraw(AccountId, Decimal),
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    },
    /// Receive code; static with a fixed amount when one is given.
    Receive {
        owner: AccountId,
        amount: Option<Decimal>,
        label: String,
    },
    PaymentCode {
        owner: AccountId,
        label: String,
    },
    /// User pays a receive code.
    Redeem {
        redeemer: AccountId,
        label: String,
        amount: Decimal,
    },
    /// Merchant charges a payment code.
    Charge {
        merchant: AccountId,
        label: String,
        amount: Decimal,
    },
    Lock(AccountId),
    Unlock(AccountId),
}

impl CsvRecord {
    /// Converts CSV record to a Command.
    ///
    /// Returns `None` for unknown ops or missing required fields.
    fn into_command(self) -> Option<Command> {
        let account = AccountId(self.account);

        match self.op.to_lowercase().as_str() {
            "open" => Some(Command::Open(account)),
            "deposit" => Some(Command::Deposit(account, self.amount?)),
            "withdraw" | "withdrawal" => Some(Command::Withdraw(account, self.amount?)),
            "transfer" => Some(Command::Transfer {
                from: account,
                to: AccountId(self.counterparty?),
                amount: self.amount?,
            }),
            "qr" => Some(Command::Receive {
                owner: account,
                amount: self.amount,
                label: self.label?,
            }),
            "paycode" => Some(Command::PaymentCode {
                owner: account,
                label: self.label?,
            }),
            "redeem" => Some(Command::Redeem {
                redeemer: account,
                label: self.label?,
                amount: self.amount?,
            }),
            "charge" => Some(Command::Charge {
                merchant: account,
                label: self.label?,
                amount: self.amount?,
            }),
            "lock" => Some(Command::Lock(account)),
            "unlock" => Some(Command::Unlock(account)),
            _ => None,
        }
    }
}

/// Ledger state for one replay run.
pub struct Replay {
    ledger: Ledger,
    store: Arc<MemoryLedger>,
    /// CSV label to generated QR code
    codes: HashMap<String, String>,
    ctx: OpContext,
}

impl Replay {
    pub fn new(config: LedgerConfig) -> Result<Self, LedgerError> {
        let store = Arc::new(MemoryLedger::with_lock_timeout(config.lock_timeout));
        let ledger = Ledger::builder()
            .store(store.clone())
            .config(config)
            .build()?;
        Ok(Self {
            ledger,
            store,
            codes: HashMap::new(),
            ctx: OpContext::background(),
        })
    }

    fn apply(&mut self, command: Command) -> Result<(), LedgerError> {
        let ctx = &self.ctx;
        match command {
            Command::Open(account) => {
                self.ledger.open_wallet(ctx, account)?;
            }
            Command::Deposit(account, amount) => {
                self.ledger.wallets().ensure_wallet(ctx, account)?;
                self.ledger
                    .process_transaction(ctx, TransactionRequest::deposit(account, amount))?;
            }
            Command::Withdraw(account, amount) => {
                self.ledger
                    .process_transaction(ctx, TransactionRequest::withdrawal(account, amount))?;
            }
            Command::Transfer { from, to, amount } => {
                self.ledger
                    .process_transaction(ctx, TransactionRequest::transfer(from, to, amount))?;
            }
            Command::Receive {
                owner,
                amount,
                label,
            } => {
                let request = match amount {
                    Some(amount) => GenerateCode::new(owner, QrCodeType::Static).amount(amount),
                    None => GenerateCode::new(owner, QrCodeType::Receive),
                };
                let qr = self.ledger.generate_qr_code(ctx, request)?;
                self.codes.insert(label, qr.code);
            }
            Command::PaymentCode { owner, label } => {
                let request = GenerateCode::new(owner, QrCodeType::PaymentCode);
                let qr = self.ledger.generate_qr_code(ctx, request)?;
                self.codes.insert(label, qr.code);
            }
            Command::Redeem {
                redeemer,
                label,
                amount,
            } => {
                let code = self.codes.get(&label).ok_or(LedgerError::QrNotFound)?;
                self.ledger.redeem_qr_code(
                    ctx,
                    RedeemCode::new(code.clone(), amount, Caller::user(redeemer)),
                )?;
            }
            Command::Charge {
                merchant,
                label,
                amount,
            } => {
                let code = self.codes.get(&label).ok_or(LedgerError::QrNotFound)?;
                self.ledger.redeem_qr_code(
                    ctx,
                    RedeemCode::new(code.clone(), amount, Caller::merchant(merchant)),
                )?;
            }
            Command::Lock(account) => {
                self.ledger
                    .set_wallet_status(ctx, account, WalletStatus::Locked)?;
            }
            Command::Unlock(account) => {
                self.ledger
                    .set_wallet_status(ctx, account, WalletStatus::Active)?;
            }
        }
        Ok(())
    }

    /// Committed wallets ordered by owner.
    pub fn wallets(&self) -> Vec<Wallet> {
        self.store.wallets()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

/// Applies commands from a CSV reader.
///
/// Streams the input. Malformed rows and rejected commands are logged at
/// debug level and skipped.
///
/// # CSV Format
///
/// Expected columns: `op, account, counterparty, amount, label`
/// - `op`: open, deposit, withdraw, transfer, qr, paycode, redeem, charge, lock, unlock
/// - `account`: Acting account
/// - `counterparty`: Receiving account (transfer only)
/// - `amount`: Decimal amount (optional for qr)
/// - `label`: Name a generated QR code is referred to by later rows
///
/// # Example
///
/// ```csv
/// op,account,counterparty,amount,label
/// deposit,1,,100.0,
/// transfer,1,2,25.0,
/// qr,2,,,shop
/// redeem,1,,10.0,shop
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails.
pub fn process_commands<R: Read>(reader: R, replay: &mut Replay) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                debug!(line, error = %e, "skipping malformed row");
                continue;
            }
        };
        let Some(command) = record.into_command() else {
            debug!(line, "skipping invalid command");
            continue;
        };
        if let Err(e) = replay.apply(command.clone()) {
            debug!(line, command = ?command, error = %e, "command rejected");
        }
    }

    Ok(())
}

/// One output row per wallet.
#[derive(Debug, Serialize)]
struct WalletRow {
    account: AccountId,
    balance: String,
    currency: String,
    status: WalletStatus,
}

impl From<&Wallet> for WalletRow {
    fn from(wallet: &Wallet) -> Self {
        Self {
            account: wallet.owner_id,
            balance: format!("{:.4}", wallet.balance),
            currency: wallet.currency.clone(),
            status: wallet.status,
        }
    }
}

/// Write wallet states to a CSV writer with 4 decimal precision.
///
/// # Example
///
/// ```csv
/// account,balance,currency,status
/// 1,75.5000,USD,active
/// 2,25.0000,USD,locked
/// ```
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_wallets<W: Write>(wallets: &[Wallet], writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for wallet in wallets {
        wtr.serialize(WalletRow::from(wallet))?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    fn replay(csv: &str) -> Replay {
        let mut replay = Replay::new(LedgerConfig::default()).unwrap();
        process_commands(Cursor::new(csv), &mut replay).unwrap();
        replay
    }

    fn balance(replay: &Replay, account: u64) -> Decimal {
        replay.ledger().wallet(AccountId(account)).unwrap().balance
    }

    #[test]
    fn store_takes_configured_lock_timeout() {
        let config = LedgerConfig {
            lock_timeout: std::time::Duration::from_millis(250),
            ..LedgerConfig::default()
        };
        let replay = Replay::new(config).unwrap();
        assert_eq!(
            replay.store.lock_timeout(),
            std::time::Duration::from_millis(250)
        );
    }

    #[test]
    fn deposit_opens_wallet() {
        let replay = replay("op,account,counterparty,amount,label\ndeposit,1,,100.0,\n");

        assert_eq!(replay.wallets().len(), 1);
        assert_eq!(balance(&replay, 1), dec!(100.0));
    }

    #[test]
    fn deposit_withdraw_transfer() {
        let replay = replay(
            "op,account,counterparty,amount,label\n\
             deposit,1,,100.0,\n\
             open,2,,,\n\
             withdraw,1,,30.0,\n\
             transfer,1,2,20.0,\n",
        );

        assert_eq!(balance(&replay, 1), dec!(50.0));
        assert_eq!(balance(&replay, 2), dec!(20.0));
    }

    #[test]
    fn rejected_commands_are_skipped() {
        let replay = replay(
            "op,account,counterparty,amount,label\n\
             deposit,1,,10.0,\n\
             withdraw,1,,50.0,\n\
             transfer,1,9,5.0,\n\
             bogus,1,,1.0,\n",
        );

        assert_eq!(replay.wallets().len(), 1);
        assert_eq!(balance(&replay, 1), dec!(10.0));
    }

    #[test]
    fn qr_codes_by_label() {
        let replay = replay(
            "op,account,counterparty,amount,label\n\
             deposit,1,,100.0,\n\
             qr,2,,,shop\n\
             redeem,1,,15.0,shop\n\
             redeem,1,,15.0,unknown\n",
        );

        assert_eq!(balance(&replay, 1), dec!(85.0));
        assert_eq!(balance(&replay, 2), dec!(15.0));
    }

    #[test]
    fn merchant_charges_payment_code() {
        let replay = replay(
            "op,account,counterparty,amount,label\n\
             deposit,1,,100.0,\n\
             open,7,,,\n\
             paycode,1,,,card\n\
             charge,7,,40.0,card\n\
             redeem,7,,40.0,card\n",
        );

        assert_eq!(balance(&replay, 1), dec!(60.0));
        assert_eq!(balance(&replay, 7), dec!(40.0));
    }

    #[test]
    fn locked_wallet_rejects_transfer() {
        let replay = replay(
            "op,account,counterparty,amount,label\n\
             deposit,1,,100.0,\n\
             open,2,,,\n\
             lock,2,,,\n\
             transfer,1,2,20.0,\n",
        );

        assert_eq!(balance(&replay, 1), dec!(100.0));
        assert_eq!(balance(&replay, 2), dec!(0));
    }

    #[test]
    fn parse_with_whitespace_and_short_rows() {
        let replay = replay("op,account,counterparty,amount,label\n deposit , 1 , , 5.5 \nopen,3\n");

        assert_eq!(replay.wallets().len(), 2);
        assert_eq!(balance(&replay, 1), dec!(5.5));
    }

    #[test]
    fn write_wallets_to_csv() {
        let replay = replay(
            "op,account,counterparty,amount,label\n\
             deposit,2,,200.25,\n\
             deposit,1,,100.5,\n",
        );

        let mut output = Vec::new();
        write_wallets(&replay.wallets(), &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let mut lines = output.lines();
        assert_eq!(lines.next(), Some("account,balance,currency,status"));
        assert_eq!(lines.next(), Some("1,100.5000,USD,active"));
        assert_eq!(lines.next(), Some("2,200.2500,USD,active"));
    }
}
