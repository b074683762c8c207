//! Wallet store
//!
//! Owns wallets and per-coin balances. A balance row may only change while
//! its `(wallet, coin)` lock is held, and only through [`WalletStore::adjust_balance`]
//! inside an atomic batch. A missing row reads as zero.

use crate::{
    config::LockConfig,
    locks::{EntityGuard, LockTable},
    registry::CoinRegistry,
    storage::{balance_key, LedgerBatch, Storage, CF_BALANCES, CF_USER_WALLETS, CF_WALLETS},
    types::{CoinId, Holding, UserId, Wallet, WalletCoinBalance, WalletId},
    users::UserDirectory,
    Error, Result,
};
use chrono::Utc;
use std::sync::Arc;

/// Balance locks held for the duration of a batch
///
/// Dropping the guard releases every lock it holds.
pub struct BalanceGuard {
    entries: Vec<(WalletId, CoinId)>,
    _guards: Vec<EntityGuard<(WalletId, CoinId)>>,
}

impl BalanceGuard {
    /// Whether this guard holds the lock for an entry
    pub fn covers(&self, wallet_id: WalletId, coin_id: CoinId) -> bool {
        self.entries.binary_search(&(wallet_id, coin_id)).is_ok()
    }
}

impl std::fmt::Debug for BalanceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceGuard")
            .field("entries", &self.entries)
            .finish()
    }
}

/// Locks held while a wallet and its balances are being removed
pub(crate) struct WalletRemoval {
    pub(crate) wallet: Option<Wallet>,
    pub(crate) balance_rows: usize,
    _user: EntityGuard<UserId>,
    _balances: Option<BalanceGuard>,
}

/// Wallets and balances
pub struct WalletStore {
    storage: Arc<Storage>,
    users: Arc<UserDirectory>,
    registry: Arc<CoinRegistry>,
    balance_locks: LockTable<(WalletId, CoinId)>,
    user_locks: LockTable<UserId>,
}

impl WalletStore {
    /// Open over existing storage
    pub fn new(
        storage: Arc<Storage>,
        users: Arc<UserDirectory>,
        registry: Arc<CoinRegistry>,
        locking: LockConfig,
    ) -> Self {
        Self {
            storage,
            users,
            registry,
            balance_locks: LockTable::new(locking.clone()),
            user_locks: LockTable::new(locking),
        }
    }

    /// Create the user's wallet
    ///
    /// With `initial_coin`, a zero balance row for that coin is created
    /// alongside the wallet.
    pub fn create_wallet(&self, user_id: UserId, initial_coin: Option<CoinId>) -> Result<Wallet> {
        if !self.users.exists(user_id)? {
            return Err(Error::UnknownUser(user_id));
        }
        if let Some(coin_id) = initial_coin {
            if !self.registry.exists(coin_id)? {
                return Err(Error::UnknownCoin(coin_id));
            }
        }

        let mut batch = self.storage.batch();
        let (wallet, _user_guard) = self.stage_wallet(&mut batch, user_id)?;
        if !self.users.exists(user_id)? {
            return Err(Error::UnknownUser(user_id));
        }
        if let Some(coin_id) = initial_coin {
            self.stage_zero_balance(&mut batch, wallet.wallet_id, coin_id)?;
        }
        self.storage.commit(batch)?;

        tracing::info!(wallet_id = %wallet.wallet_id, user_id = %user_id, "Wallet created");
        Ok(wallet)
    }

    /// Hold a user's wallet slot
    ///
    /// Wallet creation, wallet deletion and issuance into the user's wallet
    /// all serialise on this lock. It is taken before any balance lock.
    pub(crate) fn lock_user(&self, user_id: UserId) -> Result<EntityGuard<UserId>> {
        self.user_locks.acquire(user_id)
    }

    /// Stage a new wallet row for `user_id`
    ///
    /// The returned guard holds the user's wallet slot until the batch is
    /// committed. The caller checks that the user exists.
    pub(crate) fn stage_wallet(
        &self,
        batch: &mut LedgerBatch<'_>,
        user_id: UserId,
    ) -> Result<(Wallet, EntityGuard<UserId>)> {
        let guard = self.user_locks.acquire(user_id)?;
        if self.storage.contains(CF_USER_WALLETS, &user_id.to_key())? {
            return Err(Error::DuplicateWallet(user_id));
        }

        let wallet = Wallet {
            wallet_id: WalletId::generate(),
            user_id,
            created_at: Utc::now(),
        };
        batch.put(CF_WALLETS, wallet.wallet_id.as_bytes(), &wallet)?;
        batch.put_raw(CF_USER_WALLETS, &user_id.to_key(), wallet.wallet_id.as_bytes())?;

        Ok((wallet, guard))
    }

    pub(crate) fn stage_zero_balance(
        &self,
        batch: &mut LedgerBatch<'_>,
        wallet_id: WalletId,
        coin_id: CoinId,
    ) -> Result<()> {
        let row = WalletCoinBalance {
            wallet_id,
            coin_id,
            amount: 0,
            updated_at: Utc::now(),
        };
        batch.put(CF_BALANCES, &balance_key(wallet_id, coin_id), &row)
    }

    /// Get wallet by ID
    pub fn get_wallet(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.storage
            .get(CF_WALLETS, wallet_id.as_bytes())?
            .ok_or(Error::UnknownWallet(wallet_id))
    }

    /// Whether the wallet exists
    pub fn exists(&self, wallet_id: WalletId) -> Result<bool> {
        self.storage.contains(CF_WALLETS, wallet_id.as_bytes())
    }

    /// The user's wallet, if it has one
    pub fn wallet_for_user(&self, user_id: UserId) -> Result<Option<Wallet>> {
        let stored = self.storage.get_raw(CF_USER_WALLETS, &user_id.to_key())?;
        match stored.as_deref().and_then(WalletId::from_key) {
            Some(wallet_id) => self.get_wallet(wallet_id).map(Some),
            None => Ok(None),
        }
    }

    /// Amount of `coin_id` held by `wallet_id`
    pub fn get_balance(&self, wallet_id: WalletId, coin_id: CoinId) -> Result<u64> {
        if !self.exists(wallet_id)? {
            return Err(Error::UnknownWallet(wallet_id));
        }
        if !self.registry.exists(coin_id)? {
            return Err(Error::UnknownCoin(coin_id));
        }
        self.read_balance(wallet_id, coin_id)
    }

    fn read_balance(&self, wallet_id: WalletId, coin_id: CoinId) -> Result<u64> {
        Ok(self
            .storage
            .get::<WalletCoinBalance>(CF_BALANCES, &balance_key(wallet_id, coin_id))?
            .map(|row| row.amount)
            .unwrap_or(0))
    }

    /// Lock balance entries in ascending `(wallet, coin)` order
    pub fn lock_balances(&self, entries: &[(WalletId, CoinId)]) -> Result<BalanceGuard> {
        let mut entries = entries.to_vec();
        entries.sort_unstable();
        entries.dedup();

        let guards = self.balance_locks.acquire_ordered(&entries)?;
        Ok(BalanceGuard {
            entries,
            _guards: guards,
        })
    }

    /// Stage `balance += delta` for one entry
    ///
    /// The entry must be covered by `guard`, and each entry may be adjusted
    /// at most once per batch. Returns the new amount.
    pub fn adjust_balance(
        &self,
        batch: &mut LedgerBatch<'_>,
        guard: &BalanceGuard,
        wallet_id: WalletId,
        coin_id: CoinId,
        delta: i128,
    ) -> Result<u64> {
        if !guard.covers(wallet_id, coin_id) {
            return Err(Error::Concurrency(format!(
                "Balance lock not held for wallet {} coin {}",
                wallet_id, coin_id
            )));
        }

        let current = self.read_balance(wallet_id, coin_id)?;
        let next = i128::from(current) + delta;
        if next < 0 {
            return Err(Error::InsufficientBalance {
                wallet: wallet_id,
                coin: coin_id,
                available: current,
                requested: u64::try_from(-delta).unwrap_or(u64::MAX),
            });
        }
        let amount = u64::try_from(next).map_err(|_| {
            Error::InvalidInput(format!(
                "Balance overflow for wallet {} coin {}",
                wallet_id, coin_id
            ))
        })?;

        let row = WalletCoinBalance {
            wallet_id,
            coin_id,
            amount,
            updated_at: Utc::now(),
        };
        batch.put(CF_BALANCES, &balance_key(wallet_id, coin_id), &row)?;
        Ok(amount)
    }

    /// Every balance row of a wallet, joined with its coin
    pub fn holdings(&self, wallet_id: WalletId) -> Result<Vec<Holding>> {
        if !self.exists(wallet_id)? {
            return Err(Error::UnknownWallet(wallet_id));
        }

        let rows = self.balance_rows(wallet_id)?;
        rows.into_iter()
            .map(|row| {
                Ok(Holding {
                    coin: self.registry.get_coin(row.coin_id)?,
                    amount: row.amount,
                })
            })
            .collect()
    }

    fn balance_rows(&self, wallet_id: WalletId) -> Result<Vec<WalletCoinBalance>> {
        let mut rows: Vec<WalletCoinBalance> = Vec::new();
        self.storage
            .scan_prefix(CF_BALANCES, wallet_id.as_bytes(), |_, value| {
                rows.push(bincode::deserialize(value)?);
                Ok(true)
            })?;
        Ok(rows)
    }

    /// Remove a wallet and all of its balance rows
    pub fn delete_wallet(&self, wallet_id: WalletId) -> Result<()> {
        let wallet = self.get_wallet(wallet_id)?;

        let mut batch = self.storage.batch();
        let removal = self.stage_delete_for_user(&mut batch, wallet.user_id)?;
        self.storage.commit(batch)?;

        tracing::info!(
            wallet_id = %wallet_id,
            balance_rows = removal.balance_rows,
            "Wallet deleted"
        );
        Ok(())
    }

    /// Stage removal of the user's wallet and balance rows
    ///
    /// Takes the user's wallet slot and the wallet's balance lock for every
    /// coin, so no transfer can touch the wallet until the batch commits.
    pub(crate) fn stage_delete_for_user(
        &self,
        batch: &mut LedgerBatch<'_>,
        user_id: UserId,
    ) -> Result<WalletRemoval> {
        let user_guard = self.user_locks.acquire(user_id)?;
        let Some(wallet) = self.wallet_for_user(user_id)? else {
            return Ok(WalletRemoval {
                wallet: None,
                balance_rows: 0,
                _user: user_guard,
                _balances: None,
            });
        };

        let entries: Vec<_> = self
            .registry
            .list_coins()?
            .into_iter()
            .map(|coin| (wallet.wallet_id, coin.coin_id))
            .collect();
        let balances = self.lock_balances(&entries)?;

        let rows = self.balance_rows(wallet.wallet_id)?;
        for row in &rows {
            batch.delete(CF_BALANCES, &balance_key(row.wallet_id, row.coin_id))?;
        }
        batch.delete(CF_WALLETS, wallet.wallet_id.as_bytes())?;
        batch.delete(CF_USER_WALLETS, &user_id.to_key())?;

        Ok(WalletRemoval {
            wallet: Some(wallet),
            balance_rows: rows.len(),
            _user: user_guard,
            _balances: Some(balances),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewCoin;
    use crate::Config;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        users: Arc<UserDirectory>,
        wallets: WalletStore,
        coin: CoinId,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.locking.wait_timeout_ms = 50;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let users = Arc::new(UserDirectory::new(storage.clone()).unwrap());
        let registry = Arc::new(
            CoinRegistry::new(
                storage.clone(),
                users.clone(),
                config.locking.clone(),
                config.simulator.value_floor,
            )
            .unwrap(),
        );
        let creator = users.register("minter", "hash").unwrap();
        let coin = registry
            .create_coin(NewCoin {
                name: "Bitcorn".to_string(),
                creator: creator.id,
                initial_value: Decimal::from(100),
                volatility: 0.1,
                supply: 1000,
            })
            .unwrap()
            .coin_id;
        let wallets = WalletStore::new(storage.clone(), users.clone(), registry, config.locking);

        Fixture {
            storage,
            users,
            wallets,
            coin,
            _temp: temp_dir,
        }
    }

    fn credit(fx: &Fixture, wallet_id: WalletId, amount: u64) {
        let guard = fx.wallets.lock_balances(&[(wallet_id, fx.coin)]).unwrap();
        let mut batch = fx.storage.batch();
        fx.wallets
            .adjust_balance(&mut batch, &guard, wallet_id, fx.coin, i128::from(amount))
            .unwrap();
        fx.storage.commit(batch).unwrap();
    }

    #[test]
    fn test_create_wallet_once_per_user() {
        let fx = fixture();
        let user = fx.users.register("alice", "hash").unwrap();

        let wallet = fx.wallets.create_wallet(user.id, Some(fx.coin)).unwrap();
        assert_eq!(wallet.user_id, user.id);
        assert_eq!(
            fx.wallets.wallet_for_user(user.id).unwrap(),
            Some(wallet.clone())
        );
        assert_eq!(fx.wallets.get_balance(wallet.wallet_id, fx.coin).unwrap(), 0);
        assert_eq!(fx.wallets.holdings(wallet.wallet_id).unwrap().len(), 1);

        let err = fx.wallets.create_wallet(user.id, None).unwrap_err();
        assert!(matches!(err, Error::DuplicateWallet(id) if id == user.id));
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn test_create_wallet_unknown_user() {
        let fx = fixture();
        assert!(matches!(
            fx.wallets.create_wallet(UserId::new(404), None),
            Err(Error::UnknownUser(_))
        ));
    }

    #[test]
    fn test_missing_row_reads_zero() {
        let fx = fixture();
        let user = fx.users.register("bob", "hash").unwrap();
        let wallet = fx.wallets.create_wallet(user.id, None).unwrap();

        assert_eq!(fx.wallets.get_balance(wallet.wallet_id, fx.coin).unwrap(), 0);
        assert!(fx.wallets.holdings(wallet.wallet_id).unwrap().is_empty());
        assert!(matches!(
            fx.wallets.get_balance(WalletId::generate(), fx.coin),
            Err(Error::UnknownWallet(_))
        ));
        assert!(matches!(
            fx.wallets.get_balance(wallet.wallet_id, CoinId::new(99)),
            Err(Error::UnknownCoin(_))
        ));
    }

    #[test]
    fn test_adjust_balance_rejects_overdraft() {
        let fx = fixture();
        let user = fx.users.register("carol", "hash").unwrap();
        let wallet = fx.wallets.create_wallet(user.id, None).unwrap().wallet_id;
        credit(&fx, wallet, 50);

        let guard = fx.wallets.lock_balances(&[(wallet, fx.coin)]).unwrap();
        let mut batch = fx.storage.batch();
        let err = fx
            .wallets
            .adjust_balance(&mut batch, &guard, wallet, fx.coin, -51)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientBalance {
                available: 50,
                requested: 51,
                ..
            }
        ));
        assert!(batch.is_empty());
        drop(guard);

        assert_eq!(fx.wallets.get_balance(wallet, fx.coin).unwrap(), 50);
    }

    #[test]
    fn test_adjust_requires_lock() {
        let fx = fixture();
        let user = fx.users.register("dave", "hash").unwrap();
        let wallet = fx.wallets.create_wallet(user.id, None).unwrap().wallet_id;

        let guard = fx.wallets.lock_balances(&[]).unwrap();
        let mut batch = fx.storage.batch();
        assert!(matches!(
            fx.wallets
                .adjust_balance(&mut batch, &guard, wallet, fx.coin, 1),
            Err(Error::Concurrency(_))
        ));
    }

    #[test]
    fn test_locked_entry_reports_busy() {
        let fx = fixture();
        let user = fx.users.register("erin", "hash").unwrap();
        let wallet = fx.wallets.create_wallet(user.id, None).unwrap().wallet_id;

        let _held = fx.wallets.lock_balances(&[(wallet, fx.coin)]).unwrap();
        let err = fx.wallets.lock_balances(&[(wallet, fx.coin)]).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_delete_wallet_removes_balances() {
        let fx = fixture();
        let user = fx.users.register("frank", "hash").unwrap();
        let wallet = fx.wallets.create_wallet(user.id, Some(fx.coin)).unwrap().wallet_id;
        credit(&fx, wallet, 10);

        fx.wallets.delete_wallet(wallet).unwrap();

        assert!(!fx.wallets.exists(wallet).unwrap());
        assert_eq!(fx.wallets.wallet_for_user(user.id).unwrap(), None);
        assert!(fx
            .storage
            .get::<WalletCoinBalance>(CF_BALANCES, &balance_key(wallet, fx.coin))
            .unwrap()
            .is_none());

        // The slot is free again
        assert!(fx.wallets.create_wallet(user.id, None).is_ok());
    }
}
