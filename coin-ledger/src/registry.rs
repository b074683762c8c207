//! Coin registry
//!
//! Owns coin definitions and is the only writer of a coin's current value.
//! Value updates are serialised per coin; readers never wait on them.

use crate::{
    config::LockConfig,
    locks::{EntityGuard, LockTable},
    storage::{LedgerBatch, Sequence, Storage, CF_COINS},
    types::{Coin, CoinId, NewCoin, UserId},
    users::UserDirectory,
    Error, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Coin definitions and current values
pub struct CoinRegistry {
    storage: Arc<Storage>,
    users: Arc<UserDirectory>,
    ids: Sequence,
    value_locks: LockTable<CoinId>,
    floor: Decimal,
}

impl CoinRegistry {
    /// Open over existing storage
    ///
    /// `floor` is the smallest value a coin may hold.
    pub fn new(
        storage: Arc<Storage>,
        users: Arc<UserDirectory>,
        locking: LockConfig,
        floor: Decimal,
    ) -> Result<Self> {
        let ids = Sequence::resume(&storage, CF_COINS)?;
        Ok(Self {
            storage,
            users,
            ids,
            value_locks: LockTable::new(locking),
            floor,
        })
    }

    /// Create a coin with no issuance
    pub fn create_coin(&self, new: NewCoin) -> Result<Coin> {
        let mut batch = self.storage.batch();
        let coin = self.stage_create(&mut batch, new)?;
        self.storage.commit(batch)?;

        tracing::info!(coin_id = %coin.coin_id, name = %coin.name, "Coin created");
        Ok(coin)
    }

    /// Validate and stage a new coin row
    pub(crate) fn stage_create(&self, batch: &mut LedgerBatch<'_>, new: NewCoin) -> Result<Coin> {
        new.validate()?;
        if !self.users.exists(new.creator)? {
            return Err(Error::UnknownUser(new.creator));
        }

        let now = Utc::now();
        let coin = Coin {
            coin_id: CoinId::new(self.ids.next()),
            name: new.name.trim().to_string(),
            creator_user_id: new.creator,
            current_value: new.initial_value,
            volatility: new.volatility,
            supply: new.supply,
            created_at: now,
            updated_at: now,
        };

        batch.put(CF_COINS, &coin.coin_id.to_key(), &coin)?;
        Ok(coin)
    }

    /// Get coin by ID
    pub fn get_coin(&self, coin_id: CoinId) -> Result<Coin> {
        self.storage
            .get(CF_COINS, &coin_id.to_key())?
            .ok_or(Error::UnknownCoin(coin_id))
    }

    /// Whether the coin exists
    pub fn exists(&self, coin_id: CoinId) -> Result<bool> {
        self.storage.contains(CF_COINS, &coin_id.to_key())
    }

    /// All coins in id order
    pub fn list_coins(&self) -> Result<Vec<Coin>> {
        self.storage.scan_all(CF_COINS)
    }

    /// Coins created by one user
    pub fn coins_by_creator(&self, user_id: UserId) -> Result<Vec<Coin>> {
        Ok(self
            .list_coins()?
            .into_iter()
            .filter(|coin| coin.creator_user_id == user_id)
            .collect())
    }

    /// Latest committed value
    pub fn current_value(&self, coin_id: CoinId) -> Result<Decimal> {
        Ok(self.get_coin(coin_id)?.current_value)
    }

    /// Smallest value a coin may hold
    pub fn floor(&self) -> Decimal {
        self.floor
    }

    /// Set a coin's current value
    ///
    /// Values below the floor are clamped to it. The write is durable before
    /// this returns.
    pub fn update_value(&self, coin_id: CoinId, value: Decimal) -> Result<Coin> {
        let (_, coin, _guard) = self.step_value_at(coin_id, Utc::now(), |_| value)?;
        Ok(coin)
    }

    /// Replace a coin's value with `step` of the committed coin, under the
    /// coin's lock
    ///
    /// Returns the previous value and the updated coin along with the lock;
    /// follow-up writes for the same step happen before it is dropped.
    pub(crate) fn step_value_at<F>(
        &self,
        coin_id: CoinId,
        at: DateTime<Utc>,
        step: F,
    ) -> Result<(Decimal, Coin, EntityGuard<CoinId>)>
    where
        F: FnOnce(&Coin) -> Decimal,
    {
        let guard = self.value_locks.acquire(coin_id)?;

        let mut coin = self.get_coin(coin_id)?;
        let previous = coin.current_value;
        coin.current_value = step(&coin).max(self.floor);
        coin.updated_at = at;

        let mut batch = self.storage.batch();
        batch.put(CF_COINS, &coin_id.to_key(), &coin)?;
        self.storage.commit(batch)?;

        Ok((previous, coin, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    struct Fixture {
        registry: CoinRegistry,
        creator: UserId,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let storage = Arc::new(Storage::open(&config).unwrap());
        let users = Arc::new(UserDirectory::new(storage.clone()).unwrap());
        let creator = users.register("minter", "hash").unwrap().id;
        let registry = CoinRegistry::new(
            storage,
            users,
            config.locking.clone(),
            config.simulator.value_floor,
        )
        .unwrap();

        Fixture {
            registry,
            creator,
            _temp: temp_dir,
        }
    }

    fn new_coin(creator: UserId, name: &str) -> NewCoin {
        NewCoin {
            name: name.to_string(),
            creator,
            initial_value: Decimal::from(100),
            volatility: 0.1,
            supply: 1000,
        }
    }

    #[test]
    fn test_create_and_get() {
        let fx = fixture();
        let coin = fx.registry.create_coin(new_coin(fx.creator, "Bitcorn")).unwrap();

        assert_eq!(coin.coin_id, CoinId::new(1));
        assert_eq!(fx.registry.get_coin(coin.coin_id).unwrap(), coin);
        assert_eq!(
            fx.registry.current_value(coin.coin_id).unwrap(),
            Decimal::from(100)
        );
    }

    #[test]
    fn test_unknown_creator() {
        let fx = fixture();
        let err = fx
            .registry
            .create_coin(new_coin(UserId::new(42), "Ghost"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownUser(id) if id == UserId::new(42)));
        assert!(fx.registry.list_coins().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_volatility() {
        let fx = fixture();
        let coin = NewCoin {
            volatility: 1.5,
            ..new_coin(fx.creator, "Wild")
        };
        assert!(matches!(
            fx.registry.create_coin(coin),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_list_and_filter_by_creator() {
        let fx = fixture();
        fx.registry.create_coin(new_coin(fx.creator, "A")).unwrap();
        fx.registry.create_coin(new_coin(fx.creator, "B")).unwrap();

        let names: Vec<_> = fx
            .registry
            .list_coins()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(fx.registry.coins_by_creator(fx.creator).unwrap().len(), 2);
        assert!(fx
            .registry
            .coins_by_creator(UserId::new(99))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_update_value_clamps_to_floor() {
        let fx = fixture();
        let coin = fx.registry.create_coin(new_coin(fx.creator, "Dust")).unwrap();

        let updated = fx
            .registry
            .update_value(coin.coin_id, Decimal::from(-5))
            .unwrap();
        assert_eq!(updated.current_value, fx.registry.floor());
        assert!(updated.current_value > Decimal::ZERO);

        let updated = fx
            .registry
            .update_value(coin.coin_id, Decimal::new(12345, 2))
            .unwrap();
        assert_eq!(
            fx.registry.current_value(coin.coin_id).unwrap(),
            Decimal::new(12345, 2)
        );
        assert!(updated.updated_at >= coin.updated_at);
    }

    #[test]
    fn test_concurrent_steps_are_not_lost() {
        let fx = fixture();
        let coin = fx.registry.create_coin(new_coin(fx.creator, "Step")).unwrap();
        let start = coin.current_value;

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        fx.registry
                            .step_value_at(coin.coin_id, Utc::now(), |current| {
                                current.current_value + Decimal::ONE
                            })
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(
            fx.registry.current_value(coin.coin_id).unwrap(),
            start + Decimal::from(200)
        );
    }

    #[test]
    fn test_update_unknown_coin() {
        let fx = fixture();
        assert!(matches!(
            fx.registry.update_value(CoinId::new(7), Decimal::ONE),
            Err(Error::UnknownCoin(_))
        ));
    }
}
