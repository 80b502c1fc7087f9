//! Verdict objects and per-request merge slots.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::epoch::{self, Epoch};
use crate::error::RatelimitError;
use crate::keys::expire_key;
use crate::store::Store;

/// What the engine should do against the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read the current count without mutation.
    Peek,
    /// Count this call and report the verdict.
    Increase,
    /// Return the prior count and clear the window.
    Reset,
    /// Subtract only the calling epoch's contribution.
    ResetEpoch,
}

impl Action {
    /// Reset-type actions flip the polarity of exemption strategies.
    pub fn is_reset(self) -> bool {
        matches!(self, Self::Reset | Self::ResetEpoch)
    }
}

/// Outcome of one rate-limit check.
///
/// Created fresh per engine call; may accumulate excess counts when merged
/// into a request slot, and is otherwise treated as immutable by callers.
#[derive(Clone)]
pub struct Verdict {
    pub group: String,
    /// Counter value observed by this check.
    pub count: i64,
    /// Allowed requests per window; `None` means unlimited (sentinel paths).
    pub limit: Option<u32>,
    /// Excess requests beyond the limit: 0 means allowed. Accumulates
    /// additively when verdicts merge.
    pub request_limit: u32,
    /// Window end as epoch seconds; 0 for sentinel verdicts.
    pub end: u64,
    store: Option<Arc<dyn Store>>,
    cache_key: Option<String>,
    clock: Arc<dyn Clock>,
}

impl Verdict {
    /// A verdict for checks that never reached the store and always allow.
    pub(crate) fn bypass(group: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            group,
            count: 0,
            limit: None,
            request_limit: 0,
            end: 0,
            store: None,
            cache_key: None,
            clock,
        }
    }

    /// A verdict computed without the store (zero rates, precomputed
    /// identities).
    pub(crate) fn sidestep(
        group: String,
        limit: Option<u32>,
        request_limit: u32,
        end: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { group, count: 0, limit, request_limit, end, store: None, cache_key: None, clock }
    }

    /// A verdict backed by a live counter.
    pub(crate) fn counted(
        group: String,
        count: i64,
        limit: u32,
        end: u64,
        store: Arc<dyn Store>,
        cache_key: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            group,
            count,
            limit: Some(limit),
            request_limit: u32::from(count > i64::from(limit)),
            end,
            store: Some(store),
            cache_key: Some(cache_key),
            clock,
        }
    }

    pub fn allowed(&self) -> bool {
        self.request_limit == 0
    }

    /// Whether this verdict is backed by a store entry it can reset.
    pub fn can_reset(&self) -> bool {
        self.store.is_some() && self.cache_key.is_some()
    }

    /// Returns whether the check passed; with `block`, a denied check is an
    /// [`RatelimitError::Exceeded`] carrying this verdict.
    pub fn check(&self, block: bool) -> Result<bool, RatelimitError> {
        if self.request_limit > 0 {
            if block {
                return Err(RatelimitError::Exceeded(self.clone()));
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Like [`check`](Self::check); with `wait`, a denied check first
    /// suspends on the cooperative scheduler until the window ends, then
    /// re-signals the denial.
    pub async fn wait_and_check(&self, wait: bool, block: bool) -> Result<bool, RatelimitError> {
        if self.request_limit > 0 && wait {
            let now = self.clock.now_secs();
            if self.end > now {
                tokio::time::sleep(Duration::from_secs(self.end - now)).await;
            }
        }
        self.check(block)
    }

    /// Merge this verdict into `slots` under `name` and return the slot's
    /// resulting value. See [`VerdictMap::merge`] for the rules.
    pub fn merge_into(self, slots: &VerdictMap, name: &str, replace: bool) -> Verdict {
        slots.merge(name, self, replace)
    }

    /// Clear this verdict's counter, or only the given epoch's contribution.
    ///
    /// Returns the counter value left behind (`None` when the verdict has no
    /// store key).
    pub fn reset(&self, epoch: &Epoch) -> Result<Option<i64>, RatelimitError> {
        let (Some(store), Some(key)) = (&self.store, &self.cache_key) else {
            return Ok(None);
        };
        let store = store.as_blocking();
        if !epoch.is_active() {
            let count = store.get(key)?.unwrap_or(0);
            store.delete_many(&[key.clone(), expire_key(key)])?;
            return Ok(Some(count));
        }
        let count = epoch::reset_epoch(epoch, store, key, self.clock.as_ref())
            .map_err(RatelimitError::Store)?;
        Ok(Some(count))
    }

    /// Awaitable twin of [`reset`](Self::reset).
    pub async fn reset_async(&self, epoch: &Epoch) -> Result<Option<i64>, RatelimitError> {
        let (Some(store), Some(key)) = (&self.store, &self.cache_key) else {
            return Ok(None);
        };
        let store = store.as_suspending();
        if !epoch.is_active() {
            let count = store.get(key).await?.unwrap_or(0);
            store.delete_many(&[key.clone(), expire_key(key)]).await?;
            return Ok(Some(count));
        }
        let count = epoch::reset_epoch_async(epoch, store, key, self.clock.as_ref())
            .await
            .map_err(RatelimitError::Store)?;
        Ok(Some(count))
    }
}

impl PartialEq for Verdict {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
            && self.count == other.count
            && self.limit == other.limit
            && self.request_limit == other.request_limit
            && self.end == other.end
    }
}

impl fmt::Debug for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verdict")
            .field("group", &self.group)
            .field("count", &self.count)
            .field("limit", &self.limit)
            .field("request_limit", &self.request_limit)
            .field("end", &self.end)
            .field("can_reset", &self.can_reset())
            .finish()
    }
}

/// Per-request slot map binding verdicts under configurable names.
///
/// One logical request may pass several checks; the slot keeps a single
/// observable result per name by merging them.
#[derive(Debug, Default)]
pub struct VerdictMap {
    slots: Mutex<HashMap<String, Verdict>>,
}

impl VerdictMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Verdict> {
        self.slots.lock().unwrap().get(name).cloned()
    }

    /// Merge `verdict` into the named slot and return the slot's value.
    ///
    /// Rules: an empty slot stores the newcomer; when the stored and new
    /// verdicts disagree on exceeded-vs-not, the exceeded one wins; when they
    /// agree, the verdict with the later window end absorbs the other's
    /// excess count additively. `replace` skips merging and overwrites.
    pub fn merge(&self, name: &str, verdict: Verdict, replace: bool) -> Verdict {
        let mut slots = self.slots.lock().unwrap();
        if replace {
            slots.insert(name.to_string(), verdict.clone());
            return verdict;
        }
        match slots.get_mut(name) {
            None => {
                slots.insert(name.to_string(), verdict.clone());
                verdict
            }
            Some(slot) if *slot == verdict => slot.clone(),
            Some(slot) => {
                if slot.allowed() != verdict.allowed() {
                    if !verdict.allowed() {
                        *slot = verdict;
                    }
                } else if verdict.end >= slot.end {
                    let mut merged = verdict;
                    merged.request_limit += slot.request_limit;
                    *slot = merged;
                } else {
                    slot.request_limit += verdict.request_limit;
                }
                slot.clone()
            }
        }
    }
}
