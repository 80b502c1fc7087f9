//! Counter store interface and the in-memory backend.
//!
//! The engine never locks around the store: same-key correctness rides
//! entirely on the backend's atomic `add`/`increment`/`decrement`. Both a
//! blocking and a suspension-point form are required so the engine can match
//! its caller's execution mode without mixing them within one check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};

/// Failure modes of a counter store backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The key was absent where the operation requires it to exist.
    #[error("key not found")]
    Missing,
    /// The backend itself failed (connection, protocol, server error).
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Blocking form of the counter store.
pub trait CounterStore: Send + Sync {
    /// Atomically create `key` with `value` and a ttl. Returns `false` when
    /// the key already exists.
    fn add(&self, key: &str, value: i64, ttl: Duration) -> Result<bool, StoreError>;

    /// Atomically increment by one. Must not refresh the ttl; window
    /// boundaries are anchored at first increment. [`StoreError::Missing`]
    /// when the key is absent.
    fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically decrement by `amount`, same contracts as `increment`.
    fn decrement(&self, key: &str, amount: i64) -> Result<i64, StoreError>;

    fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Unconditional write, used for the window-end marker.
    fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError>;

    fn delete_many(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Suspension-point form of the counter store. Same contracts as
/// [`CounterStore`], awaitable.
#[async_trait]
pub trait AsyncCounterStore: Send + Sync {
    async fn add(&self, key: &str, value: i64, ttl: Duration) -> Result<bool, StoreError>;
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;
    async fn decrement(&self, key: &str, amount: i64) -> Result<i64, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError>;
    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// A backend usable from both execution modes.
pub trait Store: CounterStore + AsyncCounterStore {
    fn as_blocking(&self) -> &dyn CounterStore;
    fn as_suspending(&self) -> &dyn AsyncCounterStore;
}

impl<T: CounterStore + AsyncCounterStore> Store for T {
    fn as_blocking(&self) -> &dyn CounterStore {
        self
    }

    fn as_suspending(&self) -> &dyn AsyncCounterStore {
        self
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: i64,
    expires_at: u64,
}

/// In-memory counter store with clock-driven lazy ttl expiry.
///
/// Suitable for single-process deployments and tests. The injectable clock
/// makes expiry deterministic under test.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    /// Drop the entry when its ttl has elapsed; returns whether a live entry
    /// remains.
    fn prune(entries: &mut HashMap<String, Entry>, key: &str, now: u64) -> bool {
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for MemoryStore {
    fn add(&self, key: &str, value: i64, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().unwrap();
        if Self::prune(&mut entries, key, now) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry { value, expires_at: now + ttl.as_secs() });
        Ok(true)
    }

    fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().unwrap();
        if !Self::prune(&mut entries, key, now) {
            return Err(StoreError::Missing);
        }
        let entry = entries.get_mut(key).ok_or(StoreError::Missing)?;
        entry.value += 1;
        Ok(entry.value)
    }

    fn decrement(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().unwrap();
        if !Self::prune(&mut entries, key, now) {
            return Err(StoreError::Missing);
        }
        let entry = entries.get_mut(key).ok_or(StoreError::Missing)?;
        entry.value -= amount;
        Ok(entry.value)
    }

    fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().unwrap();
        if !Self::prune(&mut entries, key, now) {
            return Ok(None);
        }
        Ok(entries.get(key).map(|e| e.value))
    }

    fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now_secs();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), Entry { value, expires_at: now + ttl.as_secs() });
        Ok(())
    }

    fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl AsyncCounterStore for MemoryStore {
    async fn add(&self, key: &str, value: i64, ttl: Duration) -> Result<bool, StoreError> {
        CounterStore::add(self, key, value, ttl)
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        CounterStore::increment(self, key)
    }

    async fn decrement(&self, key: &str, amount: i64) -> Result<i64, StoreError> {
        CounterStore::decrement(self, key, amount)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        CounterStore::get(self, key)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<(), StoreError> {
        CounterStore::set(self, key, value, ttl)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), StoreError> {
        CounterStore::delete_many(self, keys)
    }
}
