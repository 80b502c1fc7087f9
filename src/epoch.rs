//! Epoch-scoped increment accounting for idempotent undo.
//!
//! An epoch anchors the increments one logical request contributed to shared
//! counters, so RESET_EPOCH can subtract exactly that contribution while
//! leaving other callers' increments intact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::keys::expire_key;
use crate::store::{AsyncCounterStore, CounterStore, StoreError};

/// Per-logical-request ledger: cache key → net increments attributed to it.
#[derive(Debug, Default)]
pub struct EpochLedger {
    counts: Mutex<HashMap<String, i64>>,
}

impl EpochLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `delta` and return the running total for `key`.
    pub fn record(&self, key: &str, delta: i64) -> i64 {
        let mut counts = self.counts.lock().unwrap();
        let total = counts.get(key).copied().unwrap_or(0) + delta;
        if delta != 0 {
            counts.insert(key.to_string(), total);
        }
        total
    }

    /// The running total without mutating it.
    pub fn total(&self, key: &str) -> i64 {
        self.counts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Consume and zero the running total for `key`.
    pub fn take(&self, key: &str) -> i64 {
        self.counts.lock().unwrap().remove(key).unwrap_or(0)
    }
}

/// The identity anchor a check attributes its increments to.
#[derive(Debug, Clone, Default)]
pub enum Epoch {
    /// No ledger: RESET_EPOCH behaves like PEEK.
    #[default]
    None,
    /// Pass-through amount: RESET_EPOCH decrements by exactly this value,
    /// and INCREASE records nothing.
    Fixed(i64),
    /// A shared ledger, usually owned by the inbound request.
    Ledger(Arc<EpochLedger>),
}

impl Epoch {
    /// A fresh ledger-backed epoch.
    pub fn ledger() -> Self {
        Self::Ledger(Arc::new(EpochLedger::new()))
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub(crate) fn record_increase(&self, key: &str) {
        if let Self::Ledger(ledger) = self {
            ledger.record(key, 1);
        }
    }

    fn owed(&self, key: &str) -> i64 {
        match self {
            Self::None => 0,
            Self::Fixed(amount) => *amount,
            Self::Ledger(ledger) => ledger.total(key),
        }
    }

    fn settle(&self, key: &str) {
        if let Self::Ledger(ledger) = self {
            ledger.take(key);
        }
    }
}

/// Subtract this epoch's contribution from the shared counter.
///
/// An elapsed window is a full delete-then-0, matching how INCREASE handles
/// early expiry. A missing counter means someone already cleared it; that is
/// a no-op, not an error.
pub(crate) fn reset_epoch(
    epoch: &Epoch,
    store: &dyn CounterStore,
    cache_key: &str,
    clock: &dyn Clock,
) -> Result<i64, StoreError> {
    let owed = epoch.owed(cache_key);
    let marker = expire_key(cache_key);
    let window_end = store.get(&marker)?;
    let lapsed = window_end.map_or(true, |end| end <= clock.now_secs() as i64);
    let count = if lapsed {
        store.delete_many(&[cache_key.to_string(), marker])?;
        0
    } else {
        match store.decrement(cache_key, owed) {
            Ok(count) => count,
            Err(StoreError::Missing) => 0,
            Err(e) => return Err(e),
        }
    };
    epoch.settle(cache_key);
    Ok(count)
}

/// Awaitable twin of [`reset_epoch`].
pub(crate) async fn reset_epoch_async(
    epoch: &Epoch,
    store: &dyn AsyncCounterStore,
    cache_key: &str,
    clock: &dyn Clock,
) -> Result<i64, StoreError> {
    let owed = epoch.owed(cache_key);
    let marker = expire_key(cache_key);
    let window_end = store.get(&marker).await?;
    let lapsed = window_end.map_or(true, |end| end <= clock.now_secs() as i64);
    let count = if lapsed {
        store.delete_many(&[cache_key.to_string(), marker]).await?;
        0
    } else {
        match store.decrement(cache_key, owed).await {
            Ok(count) => count,
            Err(StoreError::Missing) => 0,
            Err(e) => return Err(e),
        }
    };
    epoch.settle(cache_key);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[test]
    fn ledger_records_and_takes() {
        let ledger = EpochLedger::new();
        assert_eq!(ledger.record("k", 1), 1);
        assert_eq!(ledger.record("k", 1), 2);
        assert_eq!(ledger.total("k"), 2);
        assert_eq!(ledger.total("other"), 0);
        assert_eq!(ledger.take("k"), 2);
        assert_eq!(ledger.total("k"), 0);
    }

    #[test]
    fn reset_subtracts_only_this_epochs_share() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        CounterStore::set(&store, "k", 4, Duration::from_secs(10)).unwrap();
        CounterStore::set(&store, "k_expire", 1_010, Duration::from_secs(10)).unwrap();

        let epoch = Epoch::ledger();
        epoch.record_increase("k");
        epoch.record_increase("k");
        let count = reset_epoch(&epoch, &store, "k", clock.as_ref()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(CounterStore::get(&store, "k").unwrap(), Some(2));
        // Ledger consumed: a second reset subtracts nothing.
        let count = reset_epoch(&epoch, &store, "k", clock.as_ref()).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn elapsed_window_is_a_full_reset() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        CounterStore::set(&store, "k", 4, Duration::from_secs(100)).unwrap();
        CounterStore::set(&store, "k_expire", 1_005, Duration::from_secs(100)).unwrap();
        clock.advance(6);

        let epoch = Epoch::ledger();
        epoch.record_increase("k");
        let count = reset_epoch(&epoch, &store, "k", clock.as_ref()).unwrap();
        assert_eq!(count, 0);
        assert_eq!(CounterStore::get(&store, "k").unwrap(), None);
    }

    #[test]
    fn fixed_epoch_passes_through() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        CounterStore::set(&store, "k", 4, Duration::from_secs(10)).unwrap();
        CounterStore::set(&store, "k_expire", 1_010, Duration::from_secs(10)).unwrap();

        let count = reset_epoch(&Epoch::Fixed(3), &store, "k", clock.as_ref()).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn missing_counter_is_a_noop() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        CounterStore::set(&store, "k_expire", 1_010, Duration::from_secs(10)).unwrap();

        let epoch = Epoch::ledger();
        epoch.record_increase("k");
        let count = reset_epoch(&epoch, &store, "k", clock.as_ref()).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn async_reset_matches_blocking() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        CounterStore::set(&store, "k", 4, Duration::from_secs(10)).unwrap();
        CounterStore::set(&store, "k_expire", 1_010, Duration::from_secs(10)).unwrap();

        let epoch = Epoch::ledger();
        epoch.record_increase("k");
        let count = reset_epoch_async(&epoch, &store, "k", clock.as_ref()).await.unwrap();
        assert_eq!(count, 3);
    }
}
