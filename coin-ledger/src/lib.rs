//! Coin Ledger
//!
//! Wallet and coin ledger for a toy virtual economy: per-wallet coin
//! balances, atomic transfers, an append-only transaction log and a
//! volatility-driven price simulator.
//!
//! # Architecture
//!
//! - **Per-entity locking**: one lock per `(wallet, coin)` balance, taken in
//!   ascending order with a bounded wait
//! - **Atomic batches**: balance rows, transaction record and indexes commit
//!   in a single synchronous RocksDB write
//! - **Independent pricing**: the simulator updates coin values on a tokio
//!   interval and never touches balance locks
//!
//! # Invariants
//!
//! - Conservation: transfers never change the total amount of a coin
//! - No negative balances, even under concurrent transfers
//! - A committed transaction always corresponds to an applied balance change
//! - Coin values stay strictly positive

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod processor;
pub mod registry;
pub mod simulator;
pub mod storage;
pub mod types;
pub mod users;
pub mod wallet;

// Re-exports
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use ledger::{CoinLaunch, Ledger};
pub use simulator::TickReport;
pub use storage::Storage;
pub use types::{
    Coin, CoinId, CoinValueSnapshot, HistoryQuery, Holding, NewCoin, RequestId, Transaction,
    TransactionId, TransferRequest, User, UserId, Wallet, WalletId,
};
