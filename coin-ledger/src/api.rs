//! Request-level interface for the HTTP layer
//!
//! Each handler maps one request onto one ledger operation and answers with
//! a status code and a JSON body. Routing and body parsing stay with the
//! caller; the DTOs here define the camelCase wire shape.

use crate::{
    types::{
        Coin, CoinId, HistoryQuery, NewCoin, RequestId, Transaction, TransactionId,
        TransferRequest, UserId, Wallet, WalletId,
    },
    Error, Ledger, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supply used when a create-coin request omits one
pub const DEFAULT_SUPPLY: u64 = 1_000_000;

/// `POST coin`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCoinRequest {
    /// Display name
    pub name: String,
    /// Wallet of the creating user
    pub creator_wallet: WalletId,
    /// Starting value, as a JSON number or a decimal string
    #[serde(deserialize_with = "rust_decimal::serde::float::deserialize")]
    pub value: Decimal,
    /// Volatility factor in [0, 1)
    pub volatility: f64,
    /// Total supply, defaults to [`DEFAULT_SUPPLY`]
    #[serde(default)]
    pub supply: Option<u64>,
}

/// `POST wallet`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletRequest {
    /// Owning user
    pub user_id: UserId,
    /// Coin to open a balance row for
    #[serde(default)]
    pub initial_coin: Option<CoinId>,
    /// Amount of `initial_coin` to issue into the wallet
    #[serde(default)]
    pub initial_amount: Option<u64>,
}

/// `POST transfer`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    /// Debited wallet
    pub sender_wallet: WalletId,
    /// Credited wallet
    pub receiver_wallet: WalletId,
    /// Coin to move
    pub coin: CoinId,
    /// Whole-coin amount
    pub amount: u64,
    /// Client id for safe retries
    #[serde(default)]
    pub request_id: Option<String>,
}

/// `GET wallet/:id/history` query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    /// Only this coin
    #[serde(default)]
    pub coin: Option<CoinId>,
    /// Page cursor: only transactions older than this id
    #[serde(default)]
    pub before: Option<TransactionId>,
    /// Page size
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Coin as returned to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinView {
    /// Coin ID
    pub coin_id: CoinId,
    /// Display name
    pub name: String,
    /// Creating user
    pub creator_user_id: UserId,
    /// Latest value
    #[serde(serialize_with = "rust_decimal::serde::float::serialize")]
    pub current_value: Decimal,
    /// Volatility factor
    pub volatility: f64,
    /// Total supply
    pub supply: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl From<Coin> for CoinView {
    fn from(coin: Coin) -> Self {
        Self {
            coin_id: coin.coin_id,
            name: coin.name,
            creator_user_id: coin.creator_user_id,
            current_value: coin.current_value,
            volatility: coin.volatility,
            supply: coin.supply,
            created_at: coin.created_at,
        }
    }
}

/// Wallet as returned to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletView {
    /// Wallet ID
    pub wallet_id: WalletId,
    /// Owning user
    pub user_id: UserId,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl From<Wallet> for WalletView {
    fn from(wallet: Wallet) -> Self {
        Self {
            wallet_id: wallet.wallet_id,
            user_id: wallet.user_id,
            created_at: wallet.created_at,
        }
    }
}

/// `GET wallet/:id/balance` response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    /// Wallet
    pub wallet_id: WalletId,
    /// Coin
    pub coin_id: CoinId,
    /// Amount held
    pub amount: u64,
}

/// Transaction as returned to clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Debited wallet, absent for issuance
    pub sender_wallet: Option<WalletId>,
    /// Credited wallet
    pub receiver_wallet: WalletId,
    /// Coin moved
    pub coin: CoinId,
    /// Amount moved
    pub amount: u64,
    /// Coin value at execution
    #[serde(serialize_with = "rust_decimal::serde::float::serialize")]
    pub price: Decimal,
    /// Execution time
    pub created_at: DateTime<Utc>,
}

impl From<Transaction> for TransferReceipt {
    fn from(tx: Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            sender_wallet: tx.sender_wallet_id,
            receiver_wallet: tx.receiver_wallet_id,
            coin: tx.coin_id,
            amount: tx.amount,
            price: tx.price,
            created_at: tx.created_at,
        }
    }
}

/// Error body
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Error kind label
    pub error: &'static str,
    /// Human-readable detail
    pub message: String,
    /// Whether the same request may be retried
    pub retryable: bool,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            error: err.kind().as_str(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Status and JSON body for one request
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// JSON body
    pub body: Value,
}

fn respond<T: Serialize>(success: u16, result: Result<T>) -> ApiResponse {
    let err = match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(body) => {
                return ApiResponse {
                    status: success,
                    body,
                }
            }
            Err(e) => Error::Storage(format!("Response encoding failed: {}", e)),
        },
        Err(err) => err,
    };

    if err.kind() == crate::ErrorKind::StorageFailure {
        tracing::error!(error = %err, "Request failed");
    }
    ApiResponse {
        status: err.http_status(),
        body: serde_json::to_value(ErrorBody::from(&err)).unwrap_or(Value::Null),
    }
}

/// `POST coin`
pub fn create_coin(ledger: &Ledger, request: CreateCoinRequest) -> ApiResponse {
    let result = ledger
        .get_wallet(request.creator_wallet)
        .and_then(|wallet| {
            ledger.create_coin(NewCoin {
                name: request.name,
                creator: wallet.user_id,
                initial_value: request.value,
                volatility: request.volatility,
                supply: request.supply.unwrap_or(DEFAULT_SUPPLY),
            })
        })
        .map(|launch| CoinView::from(launch.coin));
    respond(201, result)
}

/// `GET coin/:id`
pub fn get_coin(ledger: &Ledger, coin_id: CoinId) -> ApiResponse {
    respond(200, ledger.get_coin(coin_id).map(CoinView::from))
}

/// `POST wallet`
pub fn create_wallet(ledger: &Ledger, request: CreateWalletRequest) -> ApiResponse {
    respond(
        201,
        ledger
            .create_wallet(
                request.user_id,
                request.initial_coin,
                request.initial_amount.unwrap_or(0),
            )
            .map(WalletView::from),
    )
}

/// `GET wallet/:id/balance?coin=`
pub fn get_balance(ledger: &Ledger, wallet_id: WalletId, coin_id: CoinId) -> ApiResponse {
    let result = ledger
        .get_balance(wallet_id, coin_id)
        .map(|amount| BalanceResponse {
            wallet_id,
            coin_id,
            amount,
        });
    respond(200, result)
}

/// `POST transfer`
pub fn transfer(ledger: &Ledger, body: TransferBody) -> ApiResponse {
    let mut request = TransferRequest::new(
        body.sender_wallet,
        body.receiver_wallet,
        body.coin,
        body.amount,
    );
    if let Some(request_id) = body.request_id {
        request = request.with_request_id(RequestId::new(request_id));
    }
    respond(200, ledger.transfer(request).map(TransferReceipt::from))
}

/// `GET wallet/:id/history`
pub fn history(ledger: &Ledger, wallet_id: WalletId, params: HistoryParams) -> ApiResponse {
    let query = HistoryQuery {
        coin: params.coin,
        before: params.before,
        limit: params.limit,
    };
    let result = ledger.history(wallet_id, &query).map(|txs| {
        txs.into_iter()
            .map(TransferReceipt::from)
            .collect::<Vec<_>>()
    });
    respond(200, result)
}
