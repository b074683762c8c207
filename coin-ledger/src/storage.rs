//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `users` - User identities (key: user_id)
//! - `user_names` - Unique name index (key: user_name, value: user_id)
//! - `wallets` - Wallets (key: wallet_id)
//! - `user_wallets` - One wallet per user (key: user_id, value: wallet_id)
//! - `coins` - Coin definitions and current value (key: coin_id)
//! - `issued` - Supply issued so far (key: coin_id, value: u64)
//! - `balances` - Per-coin balances (key: wallet_id || coin_id)
//! - `transactions` - Append-only transaction log (key: tx_id)
//! - `wallet_transactions` - History index (key: wallet_id || tx_id, value: coin_id)
//! - `request_ids` - Transfer deduplication (key: request_id, value: tx_id)
//! - `coin_value_history` - Price snapshots (key: coin_id || snapshot_id)
//! - `sequences` - Id high-water marks (key: column family name, value: u64)
//!
//! Every mutation goes through [`LedgerBatch`] and is committed as one
//! atomic RocksDB write, fsync'd when `rocksdb.sync_writes` is set.

use crate::{
    error::{Error, Result},
    types::{CoinId, SnapshotId, TransactionId, WalletId},
    Config,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Column family names
pub(crate) const CF_USERS: &str = "users";
pub(crate) const CF_USER_NAMES: &str = "user_names";
pub(crate) const CF_WALLETS: &str = "wallets";
pub(crate) const CF_USER_WALLETS: &str = "user_wallets";
pub(crate) const CF_COINS: &str = "coins";
pub(crate) const CF_ISSUED: &str = "issued";
pub(crate) const CF_BALANCES: &str = "balances";
pub(crate) const CF_TRANSACTIONS: &str = "transactions";
pub(crate) const CF_WALLET_TRANSACTIONS: &str = "wallet_transactions";
pub(crate) const CF_REQUEST_IDS: &str = "request_ids";
pub(crate) const CF_COIN_VALUE_HISTORY: &str = "coin_value_history";
pub(crate) const CF_SEQUENCES: &str = "sequences";

const ALL_CFS: [&str; 12] = [
    CF_USERS,
    CF_USER_NAMES,
    CF_WALLETS,
    CF_USER_WALLETS,
    CF_COINS,
    CF_ISSUED,
    CF_BALANCES,
    CF_TRANSACTIONS,
    CF_WALLET_TRANSACTIONS,
    CF_REQUEST_IDS,
    CF_COIN_VALUE_HISTORY,
    CF_SEQUENCES,
];

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            sync_writes = config.rocksdb.sync_writes,
            "Opened RocksDB"
        );

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Append-only logs compress well and are read rarely
            CF_TRANSACTIONS | CF_COIN_VALUE_HISTORY => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Point lookups on the hot path
            CF_BALANCES | CF_REQUEST_IDS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false); // 10 bits per key
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Reads

    /// Get a bincode-encoded row
    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_pinned_cf(&cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get a raw big-endian u64 counter
    pub fn get_u64(&self, cf: &str, key: &[u8]) -> Result<Option<u64>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_pinned_cf(&cf, key)? {
            Some(value) => Ok(Some(decode_u64(&value)?)),
            None => Ok(None),
        }
    }

    /// Get raw bytes
    pub fn get_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(cf)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    /// Whether a key exists
    pub fn contains(&self, cf: &str, key: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(cf)?;
        Ok(self.db.get_pinned_cf(&cf, key)?.is_some())
    }

    /// Decode every row of a column family, in key order
    pub fn scan_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Visit keys starting with `prefix` in ascending order
    ///
    /// The visitor returns `false` to stop early.
    pub fn scan_prefix<F>(&self, cf: &str, prefix: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let cf = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) || !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// Visit keys starting with `prefix` in descending order, from the last
    /// key `<= upper`
    pub fn scan_prefix_rev<F>(&self, cf: &str, prefix: &[u8], upper: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let cf = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(upper, Direction::Reverse));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) || !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// Largest key in a column family
    pub fn last_key(&self, cf: &str) -> Result<Option<Box<[u8]>>> {
        let cf = self.cf_handle(cf)?;
        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        let last = match iter.next() {
            Some(item) => Some(item?.0),
            None => None,
        };
        Ok(last)
    }

    // Batch operations (atomic)

    /// Start an atomic batch
    pub fn batch(&self) -> LedgerBatch<'_> {
        LedgerBatch {
            storage: self,
            inner: WriteBatch::default(),
        }
    }

    /// Commit a batch as one atomic write
    pub fn commit(&self, batch: LedgerBatch<'_>) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);

        let ops = batch.inner.len();
        self.db.write_opt(batch.inner, &write_opts)?;

        tracing::trace!(ops, "Batch committed");
        Ok(())
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_users: self.approximate_count(CF_USERS)?,
            total_wallets: self.approximate_count(CF_WALLETS)?,
            total_coins: self.approximate_count(CF_COINS)?,
            total_transactions: self.approximate_count(CF_TRANSACTIONS)?,
        })
    }

    fn approximate_count(&self, cf: &str) -> Result<u64> {
        let cf = self.cf_handle(cf)?;
        // RocksDB property for approximate count
        let prop = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }

    /// Flush memtables to disk (graceful shutdown)
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        tracing::info!("RocksDB flushed");
        Ok(())
    }
}

/// Pending atomic write
pub struct LedgerBatch<'a> {
    storage: &'a Storage,
    inner: WriteBatch,
}

impl LedgerBatch<'_> {
    /// Stage a bincode-encoded row
    pub fn put<T: Serialize>(&mut self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.storage.cf_handle(cf)?;
        let value = bincode::serialize(value)?;
        self.inner.put_cf(&cf, key, value);
        Ok(())
    }

    /// Stage a raw big-endian u64
    pub fn put_u64(&mut self, cf: &str, key: &[u8], value: u64) -> Result<()> {
        self.put_raw(cf, key, &value.to_be_bytes())
    }

    /// Stage raw bytes
    pub fn put_raw(&mut self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.storage.cf_handle(cf)?;
        self.inner.put_cf(&cf, key, value);
        Ok(())
    }

    /// Stage a delete
    pub fn delete(&mut self, cf: &str, key: &[u8]) -> Result<()> {
        let cf = self.storage.cf_handle(cf)?;
        self.inner.delete_cf(&cf, key);
        Ok(())
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when nothing is staged
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Monotonic id allocator resumed from the largest stored key
///
/// Ids start at 1. An id taken by a batch that never commits is skipped.
pub(crate) struct Sequence(AtomicU64);

impl Sequence {
    /// Resume after the last key of `cf` (keys must start with a big-endian u64)
    pub(crate) fn resume(storage: &Storage, cf: &str) -> Result<Self> {
        let last = match storage.last_key(cf)? {
            Some(key) => decode_u64(key.get(..8).unwrap_or(&key[..]))?,
            None => 0,
        };
        Ok(Self(AtomicU64::new(last)))
    }

    /// Resume after the larger of the last key of `cf` and the high-water
    /// mark recorded by [`Sequence::stage_high_water`]
    ///
    /// For tables whose rows can be deleted, where the last key alone would
    /// hand out a removed id again.
    pub(crate) fn resume_persisted(storage: &Storage, cf: &str) -> Result<Self> {
        let from_keys = Self::resume(storage, cf)?.0.into_inner();
        let recorded = storage.get_u64(CF_SEQUENCES, cf.as_bytes())?.unwrap_or(0);
        Ok(Self::starting_after(from_keys.max(recorded)))
    }

    /// Stage `id` as the high-water mark for `cf`
    ///
    /// Callers stage ids in increasing order.
    pub(crate) fn stage_high_water(batch: &mut LedgerBatch<'_>, cf: &str, id: u64) -> Result<()> {
        batch.put_u64(CF_SEQUENCES, cf.as_bytes(), id)
    }

    /// Start from an explicit last value
    pub(crate) fn starting_after(last: u64) -> Self {
        Self(AtomicU64::new(last))
    }

    /// Take the next id
    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Decode a stored big-endian u64
pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Expected 8-byte counter, got {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

// Key helpers

/// `wallet_id || coin_id`
pub(crate) fn balance_key(wallet_id: WalletId, coin_id: CoinId) -> Vec<u8> {
    let mut key = wallet_id.as_bytes().to_vec();
    key.extend_from_slice(&coin_id.to_key());
    key
}

/// `wallet_id || tx_id`
pub(crate) fn wallet_tx_key(wallet_id: WalletId, tx_id: TransactionId) -> Vec<u8> {
    let mut key = wallet_id.as_bytes().to_vec();
    key.extend_from_slice(&tx_id.to_key());
    key
}

/// `coin_id || snapshot_id`
pub(crate) fn value_history_key(coin_id: CoinId, snapshot_id: SnapshotId) -> Vec<u8> {
    let mut key = coin_id.to_key().to_vec();
    key.extend_from_slice(&snapshot_id.to_key());
    key
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate user count
    pub total_users: u64,
    /// Approximate wallet count
    pub total_wallets: u64,
    /// Approximate coin count
    pub total_coins: u64,
    /// Approximate transaction count
    pub total_transactions: u64,
}
