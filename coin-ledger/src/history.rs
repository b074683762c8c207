//! History log
//!
//! Append-only transaction records and coin value snapshots. Records are
//! written into the same batch as the balance change they describe, so a
//! visible record always corresponds to an applied mutation.
//!
//! Transaction ids are handed out under an append lock that the caller holds
//! until its batch commits, so records become visible in id order and a
//! `before` cursor never skips a late commit.

use crate::{
    config::HistoryConfig,
    storage::{
        value_history_key, wallet_tx_key, LedgerBatch, Sequence, Storage, CF_COIN_VALUE_HISTORY,
        CF_REQUEST_IDS, CF_TRANSACTIONS, CF_WALLET_TRANSACTIONS,
    },
    types::{
        CoinId, CoinValueSnapshot, HistoryQuery, RequestId, SnapshotId, Transaction,
        TransactionId, WalletId,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Transaction fields chosen by the caller; id and timestamp are assigned
/// when staged
#[derive(Debug, Clone)]
pub(crate) struct TransactionDraft {
    pub(crate) sender: Option<WalletId>,
    pub(crate) receiver: WalletId,
    pub(crate) coin: CoinId,
    pub(crate) amount: u64,
    pub(crate) price: Decimal,
    pub(crate) request_id: Option<RequestId>,
}

/// Held from transaction staging until its batch commits
pub(crate) type AppendGuard = ArcMutexGuard<RawMutex, ()>;

/// Transaction log and value history
pub struct HistoryLog {
    storage: Arc<Storage>,
    tx_ids: Sequence,
    append: Arc<Mutex<()>>,
    // Per-coin snapshot sequences, loaded on first use
    snapshot_ids: DashMap<CoinId, Sequence>,
    paging: HistoryConfig,
}

impl HistoryLog {
    /// Open over existing storage
    pub fn new(storage: Arc<Storage>, paging: HistoryConfig) -> Result<Self> {
        let tx_ids = Sequence::resume(&storage, CF_TRANSACTIONS)?;
        Ok(Self {
            storage,
            tx_ids,
            append: Arc::new(Mutex::new(())),
            snapshot_ids: DashMap::new(),
            paging,
        })
    }

    /// Stage a transaction record and its indexes
    ///
    /// Keep the returned guard until the batch is committed or dropped. Take
    /// it last: no other lock may be acquired while it is held.
    pub(crate) fn stage_transaction(
        &self,
        batch: &mut LedgerBatch<'_>,
        draft: TransactionDraft,
    ) -> Result<(Transaction, AppendGuard)> {
        let append = self.append.lock_arc();
        let tx = Transaction {
            id: TransactionId::new(self.tx_ids.next()),
            sender_wallet_id: draft.sender,
            receiver_wallet_id: draft.receiver,
            coin_id: draft.coin,
            amount: draft.amount,
            price: draft.price,
            request_id: draft.request_id,
            created_at: Utc::now(),
        };

        let coin_key = tx.coin_id.to_key();
        batch.put(CF_TRANSACTIONS, &tx.id.to_key(), &tx)?;
        batch.put_raw(
            CF_WALLET_TRANSACTIONS,
            &wallet_tx_key(tx.receiver_wallet_id, tx.id),
            &coin_key,
        )?;
        if let Some(sender) = tx.sender_wallet_id {
            batch.put_raw(CF_WALLET_TRANSACTIONS, &wallet_tx_key(sender, tx.id), &coin_key)?;
        }
        if let Some(request_id) = &tx.request_id {
            batch.put_u64(CF_REQUEST_IDS, request_id.as_str().as_bytes(), tx.id.get())?;
        }

        Ok((tx, append))
    }

    /// Get transaction by ID
    pub fn get_transaction(&self, tx_id: TransactionId) -> Result<Transaction> {
        self.storage
            .get(CF_TRANSACTIONS, &tx_id.to_key())?
            .ok_or(Error::TransactionNotFound(tx_id))
    }

    /// Transaction previously committed under a client request id
    pub fn find_by_request(&self, request_id: &RequestId) -> Result<Option<Transaction>> {
        match self
            .storage
            .get_u64(CF_REQUEST_IDS, request_id.as_str().as_bytes())?
        {
            Some(id) => self.get_transaction(TransactionId::new(id)).map(Some),
            None => Ok(None),
        }
    }

    /// Transactions touching a wallet, newest first
    pub fn transactions(
        &self,
        wallet_id: WalletId,
        query: &HistoryQuery,
    ) -> Result<Vec<Transaction>> {
        let limit = self.paging.page_size(query.limit);
        let upper = match query.before {
            Some(cursor) if cursor.get() == 0 => return Ok(Vec::new()),
            Some(cursor) => wallet_tx_key(wallet_id, TransactionId::new(cursor.get() - 1)),
            None => wallet_tx_key(wallet_id, TransactionId::new(u64::MAX)),
        };

        let mut ids = Vec::with_capacity(limit);
        self.storage.scan_prefix_rev(
            CF_WALLET_TRANSACTIONS,
            wallet_id.as_bytes(),
            &upper,
            |key, value| {
                let coin = CoinId::from_key(value);
                if query.coin.is_none() || coin == query.coin {
                    if let Some(id) = key.get(16..).and_then(TransactionId::from_key) {
                        ids.push(id);
                    }
                }
                Ok(ids.len() < limit)
            },
        )?;

        ids.into_iter().map(|id| self.get_transaction(id)).collect()
    }

    /// Append a value snapshot for one coin
    pub fn record_value(
        &self,
        coin_id: CoinId,
        value: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Result<CoinValueSnapshot> {
        let snapshot = CoinValueSnapshot {
            id: self.next_snapshot_id(coin_id)?,
            coin_id,
            value,
            timestamp,
        };

        let mut batch = self.storage.batch();
        batch.put(
            CF_COIN_VALUE_HISTORY,
            &value_history_key(coin_id, snapshot.id),
            &snapshot,
        )?;
        self.storage.commit(batch)?;

        Ok(snapshot)
    }

    /// Most recent snapshots for a coin, newest first
    pub fn value_history(
        &self,
        coin_id: CoinId,
        limit: Option<usize>,
    ) -> Result<Vec<CoinValueSnapshot>> {
        let limit = self.paging.page_size(limit);
        let mut snapshots: Vec<CoinValueSnapshot> = Vec::with_capacity(limit);
        self.storage.scan_prefix_rev(
            CF_COIN_VALUE_HISTORY,
            &coin_id.to_key(),
            &value_history_key(coin_id, SnapshotId::new(u64::MAX)),
            |_, value| {
                snapshots.push(bincode::deserialize(value)?);
                Ok(snapshots.len() < limit)
            },
        )?;
        Ok(snapshots)
    }

    fn next_snapshot_id(&self, coin_id: CoinId) -> Result<SnapshotId> {
        if let Some(seq) = self.snapshot_ids.get(&coin_id) {
            return Ok(SnapshotId::new(seq.next()));
        }

        let mut last = 0;
        self.storage.scan_prefix_rev(
            CF_COIN_VALUE_HISTORY,
            &coin_id.to_key(),
            &value_history_key(coin_id, SnapshotId::new(u64::MAX)),
            |key, _| {
                last = key.get(8..).and_then(SnapshotId::from_key).map_or(0, |id| id.get());
                Ok(false)
            },
        )?;

        let seq = self
            .snapshot_ids
            .entry(coin_id)
            .or_insert_with(|| Sequence::starting_after(last));
        Ok(SnapshotId::new(seq.next()))
    }
}
