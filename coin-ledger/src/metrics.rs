//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `coin_ledger_transfers_total` - Committed transfers
//! - `coin_ledger_transfers_rejected_total{reason}` - Rejected transfers by error kind
//! - `coin_ledger_transfer_duration_seconds` - Histogram of transfer latencies
//! - `coin_ledger_issuances_total` - Committed issuance records
//! - `coin_ledger_price_ticks_total` - Completed simulator ticks
//! - `coin_ledger_price_updates_total` - Coin values updated by the simulator
//! - `coin_ledger_price_update_failures_total` - Per-coin simulator failures

use crate::error::ErrorKind;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed transfers
    pub transfers_total: IntCounter,

    /// Rejected transfers, labelled by error kind
    pub transfers_rejected: IntCounterVec,

    /// Transfer duration histogram
    pub transfer_duration: Histogram,

    /// Committed issuance records
    pub issuances_total: IntCounter,

    /// Completed simulator ticks
    pub price_ticks_total: IntCounter,

    /// Coin values updated by the simulator
    pub price_updates_total: IntCounter,

    /// Per-coin simulator failures
    pub price_update_failures: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers_total =
            IntCounter::new("coin_ledger_transfers_total", "Committed transfers")?;
        registry.register(Box::new(transfers_total.clone()))?;

        let transfers_rejected = IntCounterVec::new(
            Opts::new(
                "coin_ledger_transfers_rejected_total",
                "Rejected transfers by error kind",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(transfers_rejected.clone()))?;

        let transfer_duration = Histogram::with_opts(
            HistogramOpts::new(
                "coin_ledger_transfer_duration_seconds",
                "Histogram of transfer latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(transfer_duration.clone()))?;

        let issuances_total =
            IntCounter::new("coin_ledger_issuances_total", "Committed issuance records")?;
        registry.register(Box::new(issuances_total.clone()))?;

        let price_ticks_total =
            IntCounter::new("coin_ledger_price_ticks_total", "Completed simulator ticks")?;
        registry.register(Box::new(price_ticks_total.clone()))?;

        let price_updates_total = IntCounter::new(
            "coin_ledger_price_updates_total",
            "Coin values updated by the simulator",
        )?;
        registry.register(Box::new(price_updates_total.clone()))?;

        let price_update_failures = IntCounter::new(
            "coin_ledger_price_update_failures_total",
            "Per-coin simulator failures",
        )?;
        registry.register(Box::new(price_update_failures.clone()))?;

        Ok(Self {
            transfers_total,
            transfers_rejected,
            transfer_duration,
            issuances_total,
            price_ticks_total,
            price_updates_total,
            price_update_failures,
            registry,
        })
    }

    /// Record a committed transfer
    pub fn record_transfer(&self, duration_seconds: f64) {
        self.transfers_total.inc();
        self.transfer_duration.observe(duration_seconds);
    }

    /// Record a rejected transfer
    pub fn record_rejection(&self, kind: ErrorKind) {
        self.transfers_rejected
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    /// Record a committed issuance
    pub fn record_issuance(&self) {
        self.issuances_total.inc();
    }

    /// Record a finished simulator tick
    pub fn record_tick(&self, updated: usize, failed: usize) {
        self.price_ticks_total.inc();
        self.price_updates_total.inc_by(updated as u64);
        self.price_update_failures.inc_by(failed as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("transfers_total", &self.transfers_total.get())
            .field("price_ticks_total", &self.price_ticks_total.get())
            .finish_non_exhaustive()
    }
}
