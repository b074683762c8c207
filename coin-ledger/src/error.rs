//! Error types for the coin ledger

use crate::types::{CoinId, TransactionId, UserId, WalletId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-range request data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// User not found
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    /// Wallet not found
    #[error("Unknown wallet: {0}")]
    UnknownWallet(WalletId),

    /// Coin not found
    #[error("Unknown coin: {0}")]
    UnknownCoin(CoinId),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// User already owns a wallet
    #[error("User {0} already owns a wallet")]
    DuplicateWallet(UserId),

    /// User name already taken
    #[error("User name already exists: {0}")]
    DuplicateUser(String),

    /// Sender balance does not cover the requested amount
    #[error("Insufficient balance in wallet {wallet} for coin {coin}: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Debited wallet
        wallet: WalletId,
        /// Coin being moved
        coin: CoinId,
        /// Balance at the time of the check
        available: u64,
        /// Amount requested
        requested: u64,
    },

    /// Sender and receiver are the same wallet
    #[error("Sender and receiver are the same wallet: {0}")]
    SameWallet(WalletId),

    /// Issuance would exceed the coin's fixed supply
    #[error("Supply exhausted for coin {coin}: {remaining} remaining, {requested} requested")]
    SupplyExhausted {
        /// Coin being issued
        coin: CoinId,
        /// Supply not yet issued
        remaining: u64,
        /// Amount requested
        requested: u64,
    },

    /// Lock contention exceeded the bounded wait
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (simulator task gone, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any mutation
    InvalidInput,
    /// Unknown user, wallet, coin or transaction
    NotFound,
    /// Duplicate wallet or user
    Conflict,
    /// Business-rule violation, no mutation
    InsufficientBalance,
    /// Lock wait exhausted, caller may retry
    Busy,
    /// Underlying store or runtime failure
    StorageFailure,
}

impl ErrorKind {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::Busy => "busy",
            ErrorKind::StorageFailure => "storage_failure",
        }
    }
}

impl Error {
    /// Classify into the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::SameWallet(_) | Error::SupplyExhausted { .. } => {
                ErrorKind::InvalidInput
            }
            Error::UnknownUser(_)
            | Error::UnknownWallet(_)
            | Error::UnknownCoin(_)
            | Error::TransactionNotFound(_) => ErrorKind::NotFound,
            Error::DuplicateWallet(_) | Error::DuplicateUser(_) => ErrorKind::Conflict,
            Error::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Concurrency(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::StorageFailure,
        }
    }

    /// HTTP status the request layer should answer with
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidInput => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InsufficientBalance => 402,
            ErrorKind::Busy => 503,
            ErrorKind::StorageFailure => 500,
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let wallet = WalletId::generate();
        let coin = CoinId::new(1);

        assert_eq!(Error::InvalidInput("bad".into()).http_status(), 400);
        assert_eq!(Error::SameWallet(wallet).http_status(), 400);
        assert_eq!(Error::UnknownCoin(coin).http_status(), 404);
        assert_eq!(Error::DuplicateWallet(UserId::new(7)).http_status(), 409);
        assert_eq!(
            Error::InsufficientBalance {
                wallet,
                coin,
                available: 1,
                requested: 2
            }
            .http_status(),
            402
        );
        assert_eq!(Error::Busy("lock".into()).http_status(), 503);
        assert_eq!(Error::Storage("down".into()).http_status(), 500);
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(Error::Busy("lock".into()).is_retryable());
        assert!(!Error::UnknownCoin(CoinId::new(3)).is_retryable());
        assert!(!Error::Storage("down".into()).is_retryable());
    }
}
