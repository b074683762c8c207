//! Transaction processor
//!
//! Applies transfers and issuance. Every mutation follows the same shape:
//!
//! 1. Validate inputs (no locks held)
//! 2. Lock the affected balance entries in canonical order
//! 3. Re-check state under the locks
//! 4. Stage balance rows, the transaction record and its indexes in one batch
//! 5. Commit the batch durably, then release the locks
//!
//! A failure at any step leaves storage untouched.

use crate::{
    config::LockConfig,
    history::{AppendGuard, HistoryLog, TransactionDraft},
    locks::{EntityGuard, LockTable},
    metrics::Metrics,
    registry::CoinRegistry,
    storage::{LedgerBatch, Storage, CF_ISSUED},
    types::{Coin, CoinId, HistoryQuery, RequestId, Transaction, TransactionId, TransferRequest, WalletId},
    wallet::{BalanceGuard, WalletStore},
    Error, Result,
};
use std::sync::Arc;
use std::time::Instant;

/// An issuance staged into a batch
///
/// Holds the coin's supply lock, the credited balance lock and the history
/// append lock until dropped.
pub(crate) struct StagedIssue {
    pub(crate) transaction: Transaction,
    _supply: EntityGuard<CoinId>,
    _balance: BalanceGuard,
    _append: AppendGuard,
}

/// Transfers, issuance and transaction queries
pub struct TransactionProcessor {
    storage: Arc<Storage>,
    wallets: Arc<WalletStore>,
    registry: Arc<CoinRegistry>,
    history: Arc<HistoryLog>,
    supply_locks: LockTable<CoinId>,
    request_locks: LockTable<RequestId>,
    metrics: Arc<Metrics>,
}

impl TransactionProcessor {
    /// Wire the processor to its collaborators
    pub fn new(
        storage: Arc<Storage>,
        wallets: Arc<WalletStore>,
        registry: Arc<CoinRegistry>,
        history: Arc<HistoryLog>,
        locking: LockConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            wallets,
            registry,
            history,
            supply_locks: LockTable::new(locking.clone()),
            request_locks: LockTable::new(locking),
            metrics,
        }
    }

    /// Move `amount` of a coin from one wallet to another
    ///
    /// The trade is priced at the coin's current value. A request id that
    /// was already committed returns the original record unchanged.
    pub fn transfer(&self, request: TransferRequest) -> Result<Transaction> {
        let started = Instant::now();

        match self.apply_transfer(&request) {
            Ok((tx, replayed)) => {
                if replayed {
                    tracing::debug!(tx_id = %tx.id, "Transfer replayed from request id");
                } else {
                    self.metrics
                        .record_transfer(started.elapsed().as_secs_f64());
                    tracing::info!(
                        tx_id = %tx.id,
                        sender = %request.sender,
                        receiver = %request.receiver,
                        coin_id = %request.coin,
                        amount = request.amount,
                        price = %tx.price,
                        "Transfer committed"
                    );
                }
                Ok(tx)
            }
            Err(e) => {
                self.metrics.record_rejection(e.kind());
                tracing::debug!(
                    sender = %request.sender,
                    receiver = %request.receiver,
                    coin_id = %request.coin,
                    amount = request.amount,
                    error = %e,
                    "Transfer rejected"
                );
                Err(e)
            }
        }
    }

    fn apply_transfer(&self, request: &TransferRequest) -> Result<(Transaction, bool)> {
        if request.amount == 0 {
            return Err(Error::InvalidInput(
                "Transfer amount must be positive".to_string(),
            ));
        }
        if request.sender == request.receiver {
            return Err(Error::SameWallet(request.sender));
        }

        // Held until commit so a concurrent retry sees the first result
        let _request_guard = match &request.request_id {
            Some(request_id) => {
                if request_id.as_str().is_empty() {
                    return Err(Error::InvalidInput(
                        "Request id must not be empty".to_string(),
                    ));
                }
                let guard = self.request_locks.acquire(request_id.clone())?;
                if let Some(previous) = self.history.find_by_request(request_id)? {
                    return if Self::same_transfer(&previous, request) {
                        Ok((previous, true))
                    } else {
                        Err(Error::InvalidInput(format!(
                            "Request id {} was already used for a different transfer",
                            request_id
                        )))
                    };
                }
                Some(guard)
            }
            None => None,
        };

        self.wallets.get_wallet(request.sender)?;
        self.wallets.get_wallet(request.receiver)?;
        self.registry.get_coin(request.coin)?;

        let guard = self.wallets.lock_balances(&[
            (request.sender, request.coin),
            (request.receiver, request.coin),
        ])?;

        // A wallet may have been deleted while we waited
        for wallet_id in [request.sender, request.receiver] {
            if !self.wallets.exists(wallet_id)? {
                return Err(Error::UnknownWallet(wallet_id));
            }
        }

        let price = self.registry.current_value(request.coin)?;
        let amount = i128::from(request.amount);

        let mut batch = self.storage.batch();
        self.wallets
            .adjust_balance(&mut batch, &guard, request.sender, request.coin, -amount)?;
        self.wallets
            .adjust_balance(&mut batch, &guard, request.receiver, request.coin, amount)?;
        let (tx, _append) = self.history.stage_transaction(
            &mut batch,
            TransactionDraft {
                sender: Some(request.sender),
                receiver: request.receiver,
                coin: request.coin,
                amount: request.amount,
                price,
                request_id: request.request_id.clone(),
            },
        )?;
        self.storage.commit(batch)?;

        Ok((tx, false))
    }

    fn same_transfer(tx: &Transaction, request: &TransferRequest) -> bool {
        tx.sender_wallet_id == Some(request.sender)
            && tx.receiver_wallet_id == request.receiver
            && tx.coin_id == request.coin
            && tx.amount == request.amount
    }

    /// Credit a wallet with newly issued supply
    ///
    /// No sufficiency check applies; the amount is bounded by the supply not
    /// yet issued.
    pub fn issue(&self, wallet_id: WalletId, coin_id: CoinId, amount: u64) -> Result<Transaction> {
        let wallet = self.wallets.get_wallet(wallet_id)?;
        let coin = self.registry.get_coin(coin_id)?;

        let _owner = self.wallets.lock_user(wallet.user_id)?;
        if !self.wallets.exists(wallet_id)? {
            return Err(Error::UnknownWallet(wallet_id));
        }

        let mut batch = self.storage.batch();
        let staged = self.stage_issue(&mut batch, wallet_id, &coin, amount)?;
        self.storage.commit(batch)?;
        self.metrics.record_issuance();

        tracing::info!(
            tx_id = %staged.transaction.id,
            wallet_id = %wallet_id,
            coin_id = %coin_id,
            amount,
            "Supply issued"
        );
        Ok(staged.transaction)
    }

    /// Stage an issuance into `batch`
    ///
    /// `coin` and the wallet may themselves be staged in the same batch. The
    /// caller holds the wallet owner's slot lock (see [`WalletStore::lock_user`])
    /// so the wallet cannot be deleted underneath, then commits and drops the
    /// returned value.
    pub(crate) fn stage_issue(
        &self,
        batch: &mut LedgerBatch<'_>,
        wallet_id: WalletId,
        coin: &Coin,
        amount: u64,
    ) -> Result<StagedIssue> {
        if amount == 0 {
            return Err(Error::InvalidInput(
                "Issued amount must be positive".to_string(),
            ));
        }

        let supply_guard = self.supply_locks.acquire(coin.coin_id)?;
        let issued = self
            .storage
            .get_u64(CF_ISSUED, &coin.coin_id.to_key())?
            .unwrap_or(0);
        let remaining = coin.supply.saturating_sub(issued);
        if amount > remaining {
            return Err(Error::SupplyExhausted {
                coin: coin.coin_id,
                remaining,
                requested: amount,
            });
        }

        let balance_guard = self.wallets.lock_balances(&[(wallet_id, coin.coin_id)])?;
        self.wallets.adjust_balance(
            batch,
            &balance_guard,
            wallet_id,
            coin.coin_id,
            i128::from(amount),
        )?;
        batch.put_u64(CF_ISSUED, &coin.coin_id.to_key(), issued + amount)?;

        let (transaction, append) = self.history.stage_transaction(
            batch,
            TransactionDraft {
                sender: None,
                receiver: wallet_id,
                coin: coin.coin_id,
                amount,
                price: coin.current_value,
                request_id: None,
            },
        )?;

        Ok(StagedIssue {
            transaction,
            _supply: supply_guard,
            _balance: balance_guard,
            _append: append,
        })
    }

    /// Supply issued so far for a coin
    pub fn issued_supply(&self, coin_id: CoinId) -> Result<u64> {
        self.registry.get_coin(coin_id)?;
        Ok(self
            .storage
            .get_u64(CF_ISSUED, &coin_id.to_key())?
            .unwrap_or(0))
    }

    /// Transactions touching a wallet, newest first
    pub fn history(&self, wallet_id: WalletId, query: &HistoryQuery) -> Result<Vec<Transaction>> {
        self.wallets.get_wallet(wallet_id)?;
        if let Some(coin_id) = query.coin {
            self.registry.get_coin(coin_id)?;
        }
        self.history.transactions(wallet_id, query)
    }

    /// Get transaction by ID
    pub fn get_transaction(&self, tx_id: TransactionId) -> Result<Transaction> {
        self.history.get_transaction(tx_id)
    }
}
