//! Per-entity lock tables
//!
//! Every mutable entity (a `(wallet, coin)` balance, a coin value, a user's
//! wallet slot) gets its own mutex, created on first use. Acquisition is a
//! bounded wait: short `try_lock_for` slices with exponential backoff
//! between them, and `Error::Busy` once the budget is spent. A slot is
//! dropped from the table when its last guard is released and nobody else
//! is waiting on it.

use crate::{config::LockConfig, Error, Result};
use dashmap::DashMap;
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Slots<K> = DashMap<K, Arc<Mutex<()>>>;

/// Held lock on one entity; released on drop
pub struct EntityGuard<K: Eq + Hash> {
    key: K,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    locks: Arc<Slots<K>>,
}

impl<K: Eq + Hash> Drop for EntityGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map holds one reference; any other is a waiter that still needs the slot.
        self.locks
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl<K: Eq + Hash + Debug> Debug for EntityGuard<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGuard").field("key", &self.key).finish()
    }
}

/// Lock table keyed by entity
pub struct LockTable<K: Eq + Hash> {
    locks: Arc<Slots<K>>,
    config: LockConfig,
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Ord + Clone + Debug,
{
    /// Create an empty table
    pub fn new(config: LockConfig) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            config,
        }
    }

    fn slot(&self, key: K) -> Arc<Mutex<()>> {
        // Clone out of the shard so no DashMap guard is held while waiting.
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Acquire one entity lock within the configured budget
    pub fn acquire(&self, key: K) -> Result<EntityGuard<K>> {
        let deadline = Instant::now() + self.config.wait_timeout();
        self.acquire_until(key, deadline)
    }

    /// Acquire several entity locks in ascending key order
    ///
    /// Duplicate keys are locked once. Either every lock is returned or none
    /// is held.
    pub fn acquire_ordered(&self, keys: &[K]) -> Result<Vec<EntityGuard<K>>> {
        let mut ordered = keys.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let deadline = Instant::now() + self.config.wait_timeout();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            // On failure the guards already taken drop here, in reverse.
            guards.push(self.acquire_until(key, deadline)?);
        }
        Ok(guards)
    }

    fn acquire_until(&self, key: K, deadline: Instant) -> Result<EntityGuard<K>> {
        let slot = self.slot(key.clone());
        let mut backoff = self.config.initial_backoff();

        loop {
            if let Some(guard) = slot.try_lock_arc_for(backoff) {
                return Ok(EntityGuard {
                    key,
                    guard: Some(guard),
                    locks: self.locks.clone(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(key = ?key, "Lock wait exhausted");
                drop(slot);
                self.locks
                    .remove_if(&key, |_, slot| Arc::strong_count(slot) == 1);
                return Err(Error::Busy(format!("Timed out waiting for lock on {:?}", key)));
            }

            backoff = (backoff * 2)
                .min(self.config.max_backoff())
                .min(deadline.saturating_duration_since(now).max(Duration::from_micros(1)));
        }
    }

    /// Number of entities currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no entity is locked or waited on
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
