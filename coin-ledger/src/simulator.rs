//! Price simulator
//!
//! Drifts every coin's value once per tick:
//!
//! ```text
//! delta     = value × volatility × N(0, 1)
//! new_value = max(value + delta, floor)
//! ```
//!
//! The new value is written through the coin registry, then appended to the
//! value history. Coins are processed independently; one failing coin is
//! logged and counted while the rest still tick.
//!
//! [`PriceSimulator::spawn`] runs ticks on a tokio interval until the
//! returned [`SimulatorHandle`] is shut down. A shutdown waits for the tick
//! in progress to finish.

use crate::{
    history::HistoryLog,
    metrics::Metrics,
    registry::CoinRegistry,
    types::CoinId,
    Error, Result,
};
use chrono::Utc;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Coins whose value was updated and recorded
    pub updated: usize,
    /// Coins that failed, with the reason
    pub failed: Vec<(CoinId, String)>,
}

/// Volatility-driven price generator
pub struct PriceSimulator {
    registry: Arc<CoinRegistry>,
    history: Arc<HistoryLog>,
    rng: Mutex<StdRng>,
    metrics: Arc<Metrics>,
}

impl PriceSimulator {
    /// Create a simulator; a seed makes the random walk reproducible
    pub fn new(
        registry: Arc<CoinRegistry>,
        history: Arc<HistoryLog>,
        metrics: Arc<Metrics>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            registry,
            history,
            rng: Mutex::new(rng),
            metrics,
        }
    }

    /// Advance every coin once
    pub fn tick(&self) -> Result<TickReport> {
        let coins = self.registry.list_coins()?;
        let floor = self.registry.floor();
        let mut report = TickReport::default();

        for coin in coins {
            let now = Utc::now();

            // The step reads the committed value under the coin lock, and the
            // snapshot is appended before that lock is released.
            let outcome = self
                .registry
                .step_value_at(coin.coin_id, now, |current| {
                    let z = gaussian(&mut *self.rng.lock());
                    next_value(current.current_value, current.volatility, z, floor)
                })
                .and_then(|(previous, updated, _guard)| {
                    self.history
                        .record_value(updated.coin_id, updated.current_value, now)
                        .map(|snapshot| (previous, snapshot))
                });

            match outcome {
                Ok((previous, snapshot)) => {
                    tracing::debug!(
                        coin_id = %coin.coin_id,
                        previous = %previous,
                        value = %snapshot.value,
                        "Coin value updated"
                    );
                    report.updated += 1;
                }
                Err(e) => {
                    tracing::warn!(coin_id = %coin.coin_id, error = %e, "Coin value update failed");
                    report.failed.push((coin.coin_id, e.to_string()));
                }
            }
        }

        self.metrics.record_tick(report.updated, report.failed.len());
        Ok(report)
    }

    /// Run ticks every `period` on the current tokio runtime
    pub fn spawn(self: Arc<Self>, period: Duration) -> SimulatorHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            tracing::info!(period_ms = period.as_millis() as u64, "Price simulator started");

            loop {
                tokio::select! {
                    biased;

                    _ = &mut stop_rx => break,

                    _ = ticker.tick() => {
                        let simulator = self.clone();
                        match tokio::task::spawn_blocking(move || simulator.tick()).await {
                            Ok(Ok(report)) if !report.failed.is_empty() => {
                                tracing::warn!(
                                    updated = report.updated,
                                    failed = report.failed.len(),
                                    "Price tick finished with failures"
                                );
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!("Price tick failed: {}", e),
                            Err(e) => tracing::error!("Price tick panicked: {}", e),
                        }
                    }
                }
            }

            tracing::info!("Price simulator stopped");
        });

        SimulatorHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a running simulator task
#[derive(Debug)]
pub struct SimulatorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SimulatorHandle {
    /// Stop after the current tick and wait for the task to exit
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            // Err means the task already exited
            let _ = stop.send(());
        }
        self.task
            .await
            .map_err(|e| Error::Concurrency(format!("Simulator task failed: {}", e)))
    }

    /// Whether the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// One random-walk step, never below `floor`
pub fn next_value(current: Decimal, volatility: f64, z: f64, floor: Decimal) -> Decimal {
    let step = Decimal::from_f64(volatility * z).unwrap_or(Decimal::ZERO);
    let proposed = current
        .checked_mul(step)
        .and_then(|delta| current.checked_add(delta))
        .unwrap_or(current)
        .round_dp(8);
    proposed.max(floor)
}

/// Standard normal draw (Box-Muller)
pub fn gaussian<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // 1 - [0, 1) keeps ln away from zero
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
