//! Main ledger orchestration layer
//!
//! This module ties together storage, the user directory, coin registry,
//! wallet store, transaction processor and price simulator into one
//! request-level API.
//!
//! # Example
//!
//! ```no_run
//! use coin_ledger::{Config, Ledger, NewCoin, TransferRequest};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> coin_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let (alice, alice_wallet) = ledger.register_user("alice", "$2b$10$...")?;
//!     let (_, bob_wallet) = ledger.register_user("bob", "$2b$10$...")?;
//!
//!     let launch = ledger.create_coin(NewCoin {
//!         name: "Bitcorn".to_string(),
//!         creator: alice.id,
//!         initial_value: Decimal::from(100),
//!         volatility: 0.1,
//!         supply: 1000,
//!     })?;
//!
//!     ledger.transfer(TransferRequest::new(
//!         alice_wallet.wallet_id,
//!         bob_wallet.wallet_id,
//!         launch.coin.coin_id,
//!         300,
//!     ))?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    history::HistoryLog,
    metrics::Metrics,
    processor::TransactionProcessor,
    registry::CoinRegistry,
    simulator::{PriceSimulator, SimulatorHandle, TickReport},
    storage::StorageStats,
    types::{
        Coin, CoinId, CoinValueSnapshot, HistoryQuery, Holding, NewCoin, Transaction,
        TransactionId, TransferRequest, User, UserId, Wallet, WalletId,
    },
    users::UserDirectory,
    wallet::WalletStore,
    Config, Error, Result, Storage,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A created coin and the issuance of its supply
#[derive(Debug, Clone, PartialEq)]
pub struct CoinLaunch {
    /// The new coin
    pub coin: Coin,
    /// Full supply credited to the creator's wallet, when the creator has one
    pub issuance: Option<Transaction>,
}

/// Main ledger interface
pub struct Ledger {
    storage: Arc<Storage>,
    users: Arc<UserDirectory>,
    registry: Arc<CoinRegistry>,
    wallets: Arc<WalletStore>,
    history: Arc<HistoryLog>,
    processor: TransactionProcessor,
    simulator: Arc<PriceSimulator>,
    simulator_task: Mutex<Option<SimulatorHandle>>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration and start the price simulator if
    /// enabled
    pub async fn open(config: Config) -> Result<Self> {
        let ledger = Self::new(config)?;
        if ledger.config.simulator.enabled {
            ledger.start_simulator();
        }
        Ok(ledger)
    }

    /// Open ledger without starting any background task
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("Metrics setup failed: {}", e)))?,
        );

        let users = Arc::new(UserDirectory::new(storage.clone())?);
        let registry = Arc::new(CoinRegistry::new(
            storage.clone(),
            users.clone(),
            config.locking.clone(),
            config.simulator.value_floor,
        )?);
        let wallets = Arc::new(WalletStore::new(
            storage.clone(),
            users.clone(),
            registry.clone(),
            config.locking.clone(),
        ));
        let history = Arc::new(HistoryLog::new(storage.clone(), config.history.clone())?);
        let processor = TransactionProcessor::new(
            storage.clone(),
            wallets.clone(),
            registry.clone(),
            history.clone(),
            config.locking.clone(),
            metrics.clone(),
        );
        let simulator = Arc::new(PriceSimulator::new(
            registry.clone(),
            history.clone(),
            metrics.clone(),
            config.simulator.seed,
        ));

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            "Ledger opened"
        );

        Ok(Self {
            storage,
            users,
            registry,
            wallets,
            history,
            processor,
            simulator,
            simulator_task: Mutex::new(None),
            metrics,
            config,
        })
    }

    /// Start the background price simulator
    ///
    /// Must be called from within a tokio runtime. Returns `false` if it was
    /// already running.
    pub fn start_simulator(&self) -> bool {
        let mut task = self.simulator_task.lock();
        if task.is_some() {
            return false;
        }
        *task = Some(
            self.simulator
                .clone()
                .spawn(self.config.simulator.tick_interval()),
        );
        true
    }

    /// Whether the background simulator is running
    pub fn simulator_running(&self) -> bool {
        self.simulator_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    // Users

    /// Register a user together with its wallet, atomically
    pub fn register_user(&self, user_name: &str, password_hash: &str) -> Result<(User, Wallet)> {
        let mut batch = self.storage.batch();
        let (user, _name_guard) = self.users.stage_register(&mut batch, user_name, password_hash)?;
        let (wallet, _wallet_guard) = self.wallets.stage_wallet(&mut batch, user.id)?;
        self.storage.commit(batch)?;

        tracing::info!(
            user_id = %user.id,
            user_name = %user.user_name,
            wallet_id = %wallet.wallet_id,
            "User registered"
        );
        Ok((user, wallet))
    }

    /// Get user by ID
    pub fn get_user(&self, user_id: UserId) -> Result<User> {
        self.users.get_user(user_id)
    }

    /// Get user by name
    pub fn user_by_name(&self, user_name: &str) -> Result<Option<User>> {
        self.users.get_user_by_name(user_name)
    }

    /// Delete a user with its wallet and balance rows
    ///
    /// Transaction records are kept.
    pub fn delete_user(&self, user_id: UserId) -> Result<()> {
        let user = self.users.get_user(user_id)?;

        let mut batch = self.storage.batch();
        let removal = self.wallets.stage_delete_for_user(&mut batch, user_id)?;
        self.users.stage_delete(&mut batch, &user)?;
        self.storage.commit(batch)?;

        tracing::info!(
            user_id = %user_id,
            wallet_id = ?removal.wallet.as_ref().map(|w| w.wallet_id),
            balance_rows = removal.balance_rows,
            "User deleted"
        );
        Ok(())
    }

    // Coins

    /// Create a coin and issue its full supply to the creator's wallet
    pub fn create_coin(&self, new: NewCoin) -> Result<CoinLaunch> {
        // Held until commit so the creator's wallet cannot vanish mid-issue
        let _creator = self.wallets.lock_user(new.creator)?;
        let mut batch = self.storage.batch();
        let coin = self.registry.stage_create(&mut batch, new)?;
        let staged = match self.wallets.wallet_for_user(coin.creator_user_id)? {
            Some(wallet) => Some(self.processor.stage_issue(
                &mut batch,
                wallet.wallet_id,
                &coin,
                coin.supply,
            )?),
            None => None,
        };
        self.storage.commit(batch)?;

        let issuance = staged.map(|staged| staged.transaction);
        if issuance.is_some() {
            self.metrics.record_issuance();
        }

        tracing::info!(
            coin_id = %coin.coin_id,
            name = %coin.name,
            creator = %coin.creator_user_id,
            supply = coin.supply,
            issued = issuance.is_some(),
            "Coin created"
        );
        Ok(CoinLaunch { coin, issuance })
    }

    /// Get coin by ID
    pub fn get_coin(&self, coin_id: CoinId) -> Result<Coin> {
        self.registry.get_coin(coin_id)
    }

    /// All coins
    pub fn list_coins(&self) -> Result<Vec<Coin>> {
        self.registry.list_coins()
    }

    /// Coins created by a user
    pub fn coins_by_creator(&self, user_id: UserId) -> Result<Vec<Coin>> {
        self.users.get_user(user_id)?;
        self.registry.coins_by_creator(user_id)
    }

    // Wallets

    /// Create a wallet for an existing user
    ///
    /// A positive `initial_amount` of `initial_coin` is issued into the new
    /// wallet in the same atomic write.
    pub fn create_wallet(
        &self,
        user_id: UserId,
        initial_coin: Option<CoinId>,
        initial_amount: u64,
    ) -> Result<Wallet> {
        if initial_amount == 0 {
            return self.wallets.create_wallet(user_id, initial_coin);
        }

        let Some(coin_id) = initial_coin else {
            return Err(Error::InvalidInput(
                "Initial amount requires an initial coin".to_string(),
            ));
        };
        if !self.users.exists(user_id)? {
            return Err(Error::UnknownUser(user_id));
        }
        let coin = self.registry.get_coin(coin_id)?;

        let mut batch = self.storage.batch();
        let (wallet, _wallet_guard) = self.wallets.stage_wallet(&mut batch, user_id)?;
        if !self.users.exists(user_id)? {
            return Err(Error::UnknownUser(user_id));
        }
        let staged = self
            .processor
            .stage_issue(&mut batch, wallet.wallet_id, &coin, initial_amount)?;
        self.storage.commit(batch)?;
        self.metrics.record_issuance();

        tracing::info!(
            wallet_id = %wallet.wallet_id,
            user_id = %user_id,
            coin_id = %coin_id,
            tx_id = %staged.transaction.id,
            amount = initial_amount,
            "Wallet created with initial issuance"
        );
        Ok(wallet)
    }

    /// Get wallet by ID
    pub fn get_wallet(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.wallets.get_wallet(wallet_id)
    }

    /// The user's wallet, if it has one
    pub fn wallet_for_user(&self, user_id: UserId) -> Result<Option<Wallet>> {
        self.users.get_user(user_id)?;
        self.wallets.wallet_for_user(user_id)
    }

    /// Remove a wallet and its balance rows
    pub fn delete_wallet(&self, wallet_id: WalletId) -> Result<()> {
        self.wallets.delete_wallet(wallet_id)
    }

    /// Amount of a coin held by a wallet
    pub fn get_balance(&self, wallet_id: WalletId, coin_id: CoinId) -> Result<u64> {
        self.wallets.get_balance(wallet_id, coin_id)
    }

    /// Every coin held by a wallet
    pub fn holdings(&self, wallet_id: WalletId) -> Result<Vec<Holding>> {
        self.wallets.holdings(wallet_id)
    }

    // Transactions

    /// Move coins between wallets
    pub fn transfer(&self, request: TransferRequest) -> Result<Transaction> {
        self.processor.transfer(request)
    }

    /// Issue unissued supply into a wallet
    pub fn issue(&self, wallet_id: WalletId, coin_id: CoinId, amount: u64) -> Result<Transaction> {
        self.processor.issue(wallet_id, coin_id, amount)
    }

    /// Supply issued so far for a coin
    pub fn issued_supply(&self, coin_id: CoinId) -> Result<u64> {
        self.processor.issued_supply(coin_id)
    }

    /// Wallet transaction history, newest first
    pub fn history(&self, wallet_id: WalletId, query: &HistoryQuery) -> Result<Vec<Transaction>> {
        self.processor.history(wallet_id, query)
    }

    /// Get transaction by ID
    pub fn get_transaction(&self, tx_id: TransactionId) -> Result<Transaction> {
        self.processor.get_transaction(tx_id)
    }

    // Prices

    /// Value snapshots for a coin, newest first
    pub fn value_history(
        &self,
        coin_id: CoinId,
        limit: Option<usize>,
    ) -> Result<Vec<CoinValueSnapshot>> {
        self.registry.get_coin(coin_id)?;
        self.history.value_history(coin_id, limit)
    }

    /// Run one price tick now
    pub fn tick_prices(&self) -> Result<TickReport> {
        self.simulator.tick()
    }

    // Operations

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Approximate row counts
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the simulator and flush storage
    pub async fn shutdown(&self) -> Result<()> {
        let task = self.simulator_task.lock().take();
        if let Some(task) = task {
            task.shutdown().await?;
        }
        self.storage.flush()?;
        tracing::info!("Ledger shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("simulator_running", &self.simulator_running())
            .finish_non_exhaustive()
    }
}
