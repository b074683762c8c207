//! Core types for the coin ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Integer coin amounts (no fractional holdings)
//! - Exact arithmetic for prices (Decimal)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! sequential_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Raw value
            pub const fn get(&self) -> u64 {
                self.0
            }

            /// Big-endian storage key (sorts numerically)
            pub fn to_key(&self) -> [u8; 8] {
                self.0.to_be_bytes()
            }

            /// Decode a storage key
            pub fn from_key(key: &[u8]) -> Option<Self> {
                let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
                Some(Self(u64::from_be_bytes(bytes)))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

sequential_id!(
    /// User identifier
    UserId
);
sequential_id!(
    /// Coin identifier
    CoinId
);
sequential_id!(
    /// Transaction identifier (monotonic, newer is larger)
    TransactionId
);
sequential_id!(
    /// Coin value snapshot identifier
    SnapshotId
);

/// Wallet identifier (UUIDv7, time-ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalletId(Uuid);

impl WalletId {
    /// Generate a fresh wallet id
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Storage key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Decode from storage key bytes
    pub fn from_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = key.get(..16)?.try_into().ok()?;
        Some(Self(Uuid::from_bytes(bytes)))
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-assigned request id used to deduplicate transfers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Create new request ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered user identity
///
/// The password hash is produced by the credential service; the ledger only
/// stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: UserId,
    /// Unique user name
    pub user_name: String,
    /// Opaque credential hash
    pub password_hash: String,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
}

/// A user's wallet (one per user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub wallet_id: WalletId,
    /// Owning user
    pub user_id: UserId,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Coin definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coin {
    /// Coin ID
    pub coin_id: CoinId,
    /// Display name
    pub name: String,
    /// User who created the coin
    pub creator_user_id: UserId,
    /// Latest simulated value (always > 0)
    pub current_value: Decimal,
    /// Volatility factor in [0, 1)
    pub volatility: f64,
    /// Fixed total supply
    pub supply: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last value update
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new coin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCoin {
    /// Display name
    pub name: String,
    /// Creating user
    pub creator: UserId,
    /// Starting value
    pub initial_value: Decimal,
    /// Volatility factor in [0, 1)
    pub volatility: f64,
    /// Fixed total supply
    pub supply: u64,
}

impl NewCoin {
    /// Check value ranges
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "Coin name must not be empty".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.volatility) {
            return Err(crate::Error::InvalidInput(format!(
                "Volatility must be in [0, 1), got {}",
                self.volatility
            )));
        }
        if self.initial_value <= Decimal::ZERO {
            return Err(crate::Error::InvalidInput(
                "Initial value must be positive".to_string(),
            ));
        }
        if self.supply == 0 {
            return Err(crate::Error::InvalidInput(
                "Supply must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Balance of one coin in one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletCoinBalance {
    /// Wallet
    pub wallet_id: WalletId,
    /// Coin
    pub coin_id: CoinId,
    /// Whole-coin amount
    pub amount: u64,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

/// A coin held by a wallet, joined with its definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    /// Coin definition
    pub coin: Coin,
    /// Amount held
    pub amount: u64,
}

impl Holding {
    /// Amount valued at the coin's current value
    pub fn market_value(&self) -> Decimal {
        self.coin.current_value * Decimal::from(self.amount)
    }
}

/// Immutable transaction log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,
    /// Debited wallet (None for issuance)
    pub sender_wallet_id: Option<WalletId>,
    /// Credited wallet
    pub receiver_wallet_id: WalletId,
    /// Coin moved
    pub coin_id: CoinId,
    /// Whole-coin amount
    pub amount: u64,
    /// Coin value at execution time
    pub price: Decimal,
    /// Client request id, if supplied
    pub request_id: Option<RequestId>,
    /// Execution timestamp
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Newly issued supply rather than a wallet-to-wallet move
    pub fn is_issuance(&self) -> bool {
        self.sender_wallet_id.is_none()
    }

    /// Whether the wallet is on either side of this record
    pub fn involves(&self, wallet_id: WalletId) -> bool {
        self.receiver_wallet_id == wallet_id || self.sender_wallet_id == Some(wallet_id)
    }

    /// Total traded value (amount × price)
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.amount)
    }
}

/// One price simulator observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinValueSnapshot {
    /// Snapshot ID
    pub id: SnapshotId,
    /// Coin observed
    pub coin_id: CoinId,
    /// Value after the tick
    pub value: Decimal,
    /// Tick timestamp
    pub timestamp: DateTime<Utc>,
}

/// Transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Debited wallet
    pub sender: WalletId,
    /// Credited wallet
    pub receiver: WalletId,
    /// Coin to move
    pub coin: CoinId,
    /// Whole-coin amount (> 0)
    pub amount: u64,
    /// Optional client request id for deduplication
    pub request_id: Option<RequestId>,
}

impl TransferRequest {
    /// Request without a deduplication id
    pub fn new(sender: WalletId, receiver: WalletId, coin: CoinId, amount: u64) -> Self {
        Self {
            sender,
            receiver,
            coin,
            amount,
            request_id: None,
        }
    }

    /// Attach a client request id
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Wallet history query (newest first)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Only this coin
    pub coin: Option<CoinId>,
    /// Only transactions older than this id (pagination cursor)
    pub before: Option<TransactionId>,
    /// Page size (defaults from config)
    pub limit: Option<usize>,
}

impl HistoryQuery {
    /// All coins, first page
    pub fn latest() -> Self {
        Self::default()
    }

    /// Filter by coin
    pub fn for_coin(mut self, coin: CoinId) -> Self {
        self.coin = Some(coin);
        self
    }

    /// Continue after a previous page
    pub fn before(mut self, cursor: TransactionId) -> Self {
        self.before = Some(cursor);
        self
    }

    /// Set page size
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_coin() -> NewCoin {
        NewCoin {
            name: "Bitcorn".to_string(),
            creator: UserId::new(1),
            initial_value: Decimal::from(100),
            volatility: 0.1,
            supply: 1000,
        }
    }

    #[test]
    fn test_sequential_id_keys_sort_numerically() {
        let low = TransactionId::new(9);
        let high = TransactionId::new(256);
        assert!(low.to_key() < high.to_key());
        assert_eq!(TransactionId::from_key(&high.to_key()), Some(high));
        assert_eq!(TransactionId::from_key(&[1, 2, 3]), None);
    }

    #[test]
    fn test_wallet_id_roundtrip_key() {
        let id = WalletId::generate();
        assert_eq!(WalletId::from_key(id.as_bytes()), Some(id));
    }

    #[test]
    fn test_new_coin_validation() {
        assert!(new_coin().validate().is_ok());

        let zero_volatility = NewCoin {
            volatility: 0.0,
            ..new_coin()
        };
        assert!(zero_volatility.validate().is_ok());

        for bad in [
            NewCoin {
                volatility: 1.0,
                ..new_coin()
            },
            NewCoin {
                volatility: -0.1,
                ..new_coin()
            },
            NewCoin {
                volatility: f64::NAN,
                ..new_coin()
            },
            NewCoin {
                initial_value: Decimal::ZERO,
                ..new_coin()
            },
            NewCoin {
                supply: 0,
                ..new_coin()
            },
            NewCoin {
                name: "  ".to_string(),
                ..new_coin()
            },
        ] {
            let err = bad.validate().unwrap_err();
            assert!(matches!(err, crate::Error::InvalidInput(_)), "{bad:?}");
        }
    }

    #[test]
    fn test_transaction_helpers() {
        let sender = WalletId::generate();
        let receiver = WalletId::generate();
        let tx = Transaction {
            id: TransactionId::new(1),
            sender_wallet_id: Some(sender),
            receiver_wallet_id: receiver,
            coin_id: CoinId::new(1),
            amount: 300,
            price: Decimal::from(100),
            request_id: None,
            created_at: Utc::now(),
        };

        assert!(!tx.is_issuance());
        assert!(tx.involves(sender));
        assert!(tx.involves(receiver));
        assert!(!tx.involves(WalletId::generate()));
        assert_eq!(tx.notional(), Decimal::from(30_000));
    }
}
