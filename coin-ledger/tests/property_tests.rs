//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Conservation: transfers never change the total amount of a coin
//! - No negative balances: overdrafts are rejected, never clamped
//! - Atomicity: a rejected transfer leaves balances and history untouched
//! - Idempotent reads: repeated balance reads agree
//! - Price floor: simulated values stay strictly positive

use coin_ledger::{
    CoinId, Config, Error, HistoryQuery, Ledger, NewCoin, RequestId, TransferRequest, WalletId,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

const SUPPLY: u64 = 1_000;

fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.simulator.enabled = false;
    config.rocksdb.sync_writes = false; // Speed up tests
    config
}

struct Market {
    ledger: Ledger,
    coin: CoinId,
    wallets: Vec<WalletId>,
    _temp: TempDir,
}

/// One coin, fully issued to the first of `wallet_count` wallets
fn create_market(wallet_count: usize, volatility: f64, seed: u64) -> Market {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    config.simulator.seed = Some(seed);
    let ledger = Ledger::new(config).unwrap();

    let mut wallets = Vec::with_capacity(wallet_count);
    let mut creator = None;
    for i in 0..wallet_count {
        let (user, wallet) = ledger.register_user(&format!("user-{i}"), "hash").unwrap();
        creator.get_or_insert(user.id);
        wallets.push(wallet.wallet_id);
    }

    let coin = ledger
        .create_coin(NewCoin {
            name: "C".to_string(),
            creator: creator.unwrap(),
            initial_value: Decimal::from(100),
            volatility,
            supply: SUPPLY,
        })
        .unwrap()
        .coin
        .coin_id;

    Market {
        ledger,
        coin,
        wallets,
        _temp: temp_dir,
    }
}

fn total(market: &Market) -> u64 {
    market
        .wallets
        .iter()
        .map(|w| market.ledger.get_balance(*w, market.coin).unwrap())
        .sum()
}

fn transfer_count(market: &Market) -> usize {
    market
        .wallets
        .iter()
        .map(|w| {
            market
                .ledger
                .history(*w, &HistoryQuery::latest().limit(500))
                .unwrap()
                .into_iter()
                .filter(|tx| !tx.is_issuance() && tx.sender_wallet_id == Some(*w))
                .count()
        })
        .sum()
}

/// Strategy for transfers between wallet indexes
fn transfer_strategy(wallets: usize) -> impl Strategy<Value = (usize, usize, u64)> {
    (0..wallets, 0..wallets, 1u64..600)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: Σ balances is invariant under any sequence of transfers
    #[test]
    fn prop_transfers_conserve_supply(
        ops in prop::collection::vec(transfer_strategy(4), 1..40)
    ) {
        let market = create_market(4, 0.1, 1);
        let mut committed = 0;

        for (from, to, amount) in ops {
            let request = TransferRequest::new(
                market.wallets[from],
                market.wallets[to],
                market.coin,
                amount,
            );
            match market.ledger.transfer(request) {
                Ok(_) => committed += 1,
                Err(Error::SameWallet(_)) => prop_assert_eq!(from, to),
                Err(Error::InsufficientBalance { available, requested, .. }) => {
                    prop_assert!(available < requested);
                }
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
            prop_assert_eq!(total(&market), SUPPLY);
        }

        prop_assert_eq!(transfer_count(&market), committed);
    }

    /// Property: an overdraft changes neither balances nor history
    #[test]
    fn prop_overdraft_is_atomic(
        seeded in 1u64..SUPPLY,
        excess in 1u64..10_000
    ) {
        let market = create_market(2, 0.1, 2);
        let (w1, w2) = (market.wallets[0], market.wallets[1]);
        // Leave w1 with exactly `seeded`
        if seeded < SUPPLY {
            market
                .ledger
                .transfer(TransferRequest::new(w1, w2, market.coin, SUPPLY - seeded))
                .unwrap();
        }
        let history_before = market.ledger.history(w1, &HistoryQuery::latest()).unwrap();
        let w2_before = market.ledger.get_balance(w2, market.coin).unwrap();

        let err = market
            .ledger
            .transfer(TransferRequest::new(w1, w2, market.coin, seeded + excess))
            .unwrap_err();

        prop_assert_eq!(err.http_status(), 402);
        prop_assert_eq!(market.ledger.get_balance(w1, market.coin).unwrap(), seeded);
        prop_assert_eq!(market.ledger.get_balance(w2, market.coin).unwrap(), w2_before);
        prop_assert_eq!(
            market.ledger.history(w1, &HistoryQuery::latest()).unwrap(),
            history_before
        );
    }

    /// Property: reads with no intervening mutation agree
    #[test]
    fn prop_balance_reads_are_idempotent(amount in 1u64..=SUPPLY) {
        let market = create_market(2, 0.1, 3);
        market
            .ledger
            .transfer(TransferRequest::new(market.wallets[0], market.wallets[1], market.coin, amount))
            .unwrap();

        for wallet in &market.wallets {
            let first = market.ledger.get_balance(*wallet, market.coin).unwrap();
            let second = market.ledger.get_balance(*wallet, market.coin).unwrap();
            prop_assert_eq!(first, second);
        }
    }

    /// Property: simulated values never reach zero
    #[test]
    fn prop_price_floor(
        volatility in 0.0f64..0.999,
        seed in any::<u64>(),
        ticks in 1usize..40
    ) {
        let market = create_market(1, volatility, seed);
        for _ in 0..ticks {
            let report = market.ledger.tick_prices().unwrap();
            prop_assert!(report.failed.is_empty());
            let coin = market.ledger.get_coin(market.coin).unwrap();
            prop_assert!(coin.current_value > Decimal::ZERO);
        }

        let snapshots = market.ledger.value_history(market.coin, Some(100)).unwrap();
        prop_assert_eq!(snapshots.len(), ticks);
        prop_assert!(snapshots.iter().all(|s| s.value > Decimal::ZERO));
    }

    /// Property: replaying a request id never moves coins twice
    #[test]
    fn prop_request_id_applies_once(amount in 1u64..=SUPPLY, replays in 1usize..5) {
        let market = create_market(2, 0.1, 4);
        let request = TransferRequest::new(market.wallets[0], market.wallets[1], market.coin, amount)
            .with_request_id(RequestId::new("retry-me"));

        let first = market.ledger.transfer(request.clone()).unwrap();
        for _ in 0..replays {
            prop_assert_eq!(market.ledger.transfer(request.clone()).unwrap(), first.clone());
        }
        prop_assert_eq!(market.ledger.get_balance(market.wallets[1], market.coin).unwrap(), amount);
    }
}

#[cfg(test)]
mod concurrent_tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_concurrent_transfers_conserve_supply() {
        let market = Arc::new(create_market(5, 0.1, 5));
        // Spread the supply so every wallet can send
        for wallet in &market.wallets[1..] {
            market
                .ledger
                .transfer(TransferRequest::new(market.wallets[0], *wallet, market.coin, 200))
                .unwrap();
        }

        std::thread::scope(|scope| {
            for worker in 0..8u64 {
                let market = market.clone();
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(worker);
                    for _ in 0..100 {
                        let from = rng.gen_range(0..market.wallets.len());
                        let to = rng.gen_range(0..market.wallets.len());
                        let amount = rng.gen_range(1..50);
                        let result = market.ledger.transfer(TransferRequest::new(
                            market.wallets[from],
                            market.wallets[to],
                            market.coin,
                            amount,
                        ));
                        if let Err(e) = result {
                            assert!(
                                matches!(
                                    e,
                                    Error::SameWallet(_)
                                        | Error::InsufficientBalance { .. }
                                        | Error::Busy(_)
                                ),
                                "unexpected error: {e}"
                            );
                        }
                    }
                });
            }
        });

        assert_eq!(total(&market), SUPPLY);
        let committed = market.ledger.metrics().transfers_total.get() as usize;
        assert_eq!(transfer_count(&market), committed);
    }

    #[test]
    fn test_opposite_transfers_commute() {
        let market = Arc::new(create_market(2, 0.1, 6));
        let (w1, w2) = (market.wallets[0], market.wallets[1]);
        market
            .ledger
            .transfer(TransferRequest::new(w1, w2, market.coin, 500))
            .unwrap();

        std::thread::scope(|scope| {
            for _ in 0..50 {
                let forward = market.clone();
                let backward = market.clone();
                let a = scope.spawn(move || {
                    forward
                        .ledger
                        .transfer(TransferRequest::new(w1, w2, forward.coin, 3))
                });
                let b = scope.spawn(move || {
                    backward
                        .ledger
                        .transfer(TransferRequest::new(w2, w1, backward.coin, 2))
                });
                a.join().unwrap().unwrap();
                b.join().unwrap().unwrap();
            }
        });

        // 50 × (−3 + 2) on w1
        assert_eq!(market.ledger.get_balance(w1, market.coin).unwrap(), 450);
        assert_eq!(market.ledger.get_balance(w2, market.coin).unwrap(), 550);
    }

    #[tokio::test]
    async fn test_simulator_runs_alongside_transfers() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(&temp_dir);
        config.simulator.enabled = true;
        config.simulator.tick_interval_ms = 5;
        config.simulator.seed = Some(9);

        let ledger = Arc::new(Ledger::open(config).await.unwrap());
        let (creator, w1) = ledger.register_user("creator", "hash").unwrap();
        let (_, w2) = ledger.register_user("trader", "hash").unwrap();
        let coin = ledger
            .create_coin(NewCoin {
                name: "Wobble".to_string(),
                creator: creator.id,
                initial_value: Decimal::from(100),
                volatility: 0.5,
                supply: SUPPLY,
            })
            .unwrap()
            .coin
            .coin_id;

        let worker = ledger.clone();
        let prices = tokio::task::spawn_blocking(move || {
            (0..50)
                .map(|_| {
                    worker
                        .transfer(TransferRequest::new(w1.wallet_id, w2.wallet_id, coin, 1))
                        .unwrap()
                        .price
                })
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        ledger.shutdown().await.unwrap();

        assert!(prices.iter().all(|p| *p > Decimal::ZERO));
        assert_eq!(ledger.get_balance(w2.wallet_id, coin).unwrap(), 50);
        assert!(!ledger.value_history(coin, None).unwrap().is_empty());
    }
}
