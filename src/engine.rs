//! The fixed-window counter engine.
//!
//! One [`Ratelimiter`] owns the configuration, the named store handles, and
//! the key-derivation memos. Checks are described by a [`Query`] and run
//! through [`Ratelimiter::get`] or [`Ratelimiter::get_async`]; both walk the
//! same decision pipeline and differ only in which store form they call.
//!
//! The engine holds no locks around store traffic. Same-key correctness
//! rides entirely on the backend's atomic `add`/`increment`/`decrement`;
//! the only engine-side concession to races is a bounded retry of the
//! add-then-increment sequence when a counter is evicted mid-flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::epoch::{self, Epoch};
use crate::error::RatelimitError;
use crate::identity::Identity;
use crate::ip::TrustedProxies;
use crate::keys::{self, expire_key, BoundedMemo, HashAlgo, KeyHasher};
use crate::methods::{MethodFilter, MethodsArg};
use crate::rate::{Rate, RateArg};
use crate::request::RequestContext;
use crate::store::{AsyncCounterStore, CounterStore, Store, StoreError};
use crate::strategies::{Key, ResolveContext};
use crate::verdict::{Action, Verdict};

/// Attempts at the add-then-increment sequence before declaring the backend
/// inconsistent.
const MAX_INCREASE_ATTEMPTS: u32 = 3;

/// Capacity of the per-engine key-derivation memos.
const MEMO_CAPACITY: usize = 256;

/// Engine-wide settings, set once at construction.
#[derive(Debug, Clone)]
pub struct RatelimiterConfig {
    key_prefix: String,
    key_hash: HashAlgo,
    group_hash: HashAlgo,
    trusted_proxies: TrustedProxies,
    enabled: bool,
    default_cache: String,
}

impl Default for RatelimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "frl:".to_string(),
            key_hash: HashAlgo::default(),
            group_hash: HashAlgo::default(),
            trusted_proxies: TrustedProxies::default(),
            enabled: true,
            default_cache: "default".to_string(),
        }
    }
}

impl RatelimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix prepended to every derived cache key.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Hash used for the identity part of cache keys.
    pub fn key_hash(mut self, algo: HashAlgo) -> Self {
        self.key_hash = algo;
        self
    }

    /// Hash used for the group part of cache keys. Changing it re-keys every
    /// live counter.
    pub fn group_hash(mut self, algo: HashAlgo) -> Self {
        self.group_hash = algo;
        self
    }

    /// Proxies whose forwarding headers are believed for client address
    /// resolution.
    pub fn trusted_proxies(mut self, trusted: TrustedProxies) -> Self {
        self.trusted_proxies = trusted;
        self
    }

    /// When false every check short-circuits to an allowing bypass verdict.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Store name used when a query names none.
    pub fn default_cache(mut self, name: impl Into<String>) -> Self {
        self.default_cache = name.into();
        self
    }
}

/// How the group name is supplied to the engine.
#[derive(Clone)]
pub enum GroupArg {
    Fixed(String),
    /// Resolved per call from the request and action.
    Dynamic(Arc<GroupFn>),
}

pub type GroupFn =
    dyn Fn(Option<&dyn RequestContext>, Action) -> Result<String, RatelimitError> + Send + Sync;

impl GroupArg {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(Option<&dyn RequestContext>, Action) -> Result<String, RatelimitError>
            + Send
            + Sync
            + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    fn resolve(
        &self,
        request: Option<&dyn RequestContext>,
        action: Action,
    ) -> Result<String, RatelimitError> {
        match self {
            Self::Fixed(group) => Ok(group.clone()),
            Self::Dynamic(f) => f(request, action),
        }
    }
}

impl From<&str> for GroupArg {
    fn from(group: &str) -> Self {
        Self::Fixed(group.to_string())
    }
}

impl From<String> for GroupArg {
    fn from(group: String) -> Self {
        Self::Fixed(group)
    }
}

impl fmt::Debug for GroupArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(group) => f.debug_tuple("Fixed").field(group).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// One rate-limit check, described declaratively.
///
/// Defaults: PEEK action, the universal method filter, a group-wide
/// identity, no rate, the engine's default cache.
pub struct Query<'r> {
    group: GroupArg,
    key: Key,
    rate: RateArg,
    methods: MethodsArg,
    request: Option<&'r dyn RequestContext>,
    action: Action,
    cache: Option<String>,
    prefix: Option<String>,
    key_hash: Option<HashAlgo>,
    empty_to: Identity,
    epoch: Option<Epoch>,
    prepared: Option<KeyHasher>,
}

impl<'r> Query<'r> {
    pub fn new(group: impl Into<GroupArg>) -> Self {
        Self {
            group: group.into(),
            key: Key::Static(Identity::Group),
            rate: RateArg::Missing,
            methods: MethodsArg::default(),
            request: None,
            action: Action::Peek,
            cache: None,
            prefix: None,
            key_hash: None,
            empty_to: Identity::bytes(""),
            epoch: None,
            prepared: None,
        }
    }

    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = key.into();
        self
    }

    pub fn rate(mut self, rate: impl Into<RateArg>) -> Self {
        self.rate = rate.into();
        self
    }

    pub fn methods(mut self, methods: impl Into<MethodsArg>) -> Self {
        self.methods = methods.into();
        self
    }

    pub fn request(mut self, request: &'r dyn RequestContext) -> Self {
        self.request = Some(request);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Use a named store instead of the engine's default cache.
    pub fn cache(mut self, name: impl Into<String>) -> Self {
        self.cache = Some(name.into());
        self
    }

    /// Override the engine's key prefix for this check.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Override the engine's identity-part hash for this check.
    pub fn key_hash(mut self, algo: HashAlgo) -> Self {
        self.key_hash = Some(algo);
        self
    }

    /// Identity substituted when the key strategy resolves to empty bytes.
    pub fn empty_to(mut self, identity: impl Into<Identity>) -> Self {
        self.empty_to = identity.into();
        self
    }

    /// Epoch to attribute increments to, overriding the request's own.
    pub fn epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// A part hasher already seeded with the window, method filter, and
    /// identity of this query. The caller guarantees it matches; the engine
    /// finalizes it as-is instead of re-hashing.
    pub fn prepared(mut self, hasher: KeyHasher) -> Self {
        self.prepared = Some(hasher);
        self
    }
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("group", &self.group)
            .field("key", &self.key)
            .field("rate", &self.rate)
            .field("methods", &self.methods)
            .field("action", &self.action)
            .field("has_request", &self.request.is_some())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Pipeline outcome before any store traffic.
enum Prepared {
    /// Decided without the store.
    Done(Verdict),
    /// A counter check that still has to run.
    Counter(CounterCheck),
}

struct CounterCheck {
    group: String,
    rate: Rate,
    cache_key: String,
    store: Arc<dyn Store>,
    action: Action,
    epoch: Epoch,
}

/// The engine. Cheap to share behind an `Arc`; all interior state is the
/// store handles and the derivation memos.
pub struct Ratelimiter {
    config: RatelimiterConfig,
    stores: HashMap<String, Arc<dyn Store>>,
    clock: Arc<dyn Clock>,
    group_memo: BoundedMemo<String, String>,
    parts_memo: BoundedMemo<(Rate, MethodFilter, HashAlgo), KeyHasher>,
}

impl Ratelimiter {
    /// An engine with an in-memory store registered as the default cache.
    pub fn new(config: RatelimiterConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let default_cache = config.default_cache.clone();
        let mut limiter = Self::bare(config, clock.clone());
        limiter.stores.insert(
            default_cache,
            Arc::new(crate::store::MemoryStore::with_clock(clock)),
        );
        limiter
    }

    /// An engine with no stores and an injected clock. Register at least the
    /// default cache before issuing counted checks.
    pub fn with_clock(config: RatelimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self::bare(config, clock)
    }

    fn bare(config: RatelimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            stores: HashMap::new(),
            clock,
            group_memo: BoundedMemo::new(MEMO_CAPACITY),
            parts_memo: BoundedMemo::new(MEMO_CAPACITY),
        }
    }

    /// Register a named store handle.
    pub fn with_store(mut self, name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        self.stores.insert(name.into(), store);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn trusted_proxies(&self) -> &TrustedProxies {
        &self.config.trusted_proxies
    }

    pub(crate) fn key_hash_algo(&self) -> HashAlgo {
        self.config.key_hash
    }

    /// Run a check, all store traffic in blocking form.
    pub fn get(&self, query: &Query<'_>) -> Result<Verdict, RatelimitError> {
        match self.prepare(query, false)? {
            Prepared::Done(verdict) => Ok(verdict),
            Prepared::Counter(check) => self.run_blocking(check),
        }
    }

    /// Run a check, all store traffic in suspension-point form.
    pub async fn get_async(&self, query: &Query<'_>) -> Result<Verdict, RatelimitError> {
        match self.prepare(query, true)? {
            Prepared::Done(verdict) => Ok(verdict),
            Prepared::Counter(check) => self.run_suspending(check).await,
        }
    }

    /// Everything up to the first store call: resolution, sentinel handling,
    /// key derivation. Identical for both execution modes.
    fn prepare(&self, query: &Query<'_>, async_mode: bool) -> Result<Prepared, RatelimitError> {
        let group = query.group.resolve(query.request, query.action)?;
        if !self.config.enabled {
            return Ok(Prepared::Done(Verdict::bypass(group, self.clock.clone())));
        }

        let methods = query.methods.resolve(query.request, &group, query.action)?;
        match query.request {
            None if !methods.is_all() => {
                return Err(RatelimitError::Misconfigured(
                    "a method filter other than ALL requires a request".to_string(),
                ))
            }
            Some(request) if !methods.contains(request.method()) => {
                return Ok(Prepared::Done(Verdict::bypass(group, self.clock.clone())));
            }
            _ => {}
        }

        let mut identity = match &query.key {
            Key::Static(identity) => identity.clone(),
            Key::Strategy(strategy) => {
                let Some(request) = query.request else {
                    return Err(RatelimitError::Misconfigured(
                        "a key strategy requires a request".to_string(),
                    ));
                };
                let cx = ResolveContext {
                    request,
                    group: &group,
                    action: query.action,
                    trusted_proxies: &self.config.trusted_proxies,
                };
                if async_mode && strategy.is_blocking() {
                    tokio::task::block_in_place(|| strategy.resolve(&cx))?
                } else {
                    strategy.resolve(&cx)?
                }
            }
        };
        if identity.is_empty_bytes() {
            identity = query.empty_to.clone();
        }
        if matches!(identity, Identity::Exempt) {
            return Ok(Prepared::Done(Verdict::bypass(group, self.clock.clone())));
        }

        let rate = query.rate.resolve(query.request, &group, query.action)?;
        let Some(rate) = rate else {
            if let Identity::Precomputed(request_limit) = identity {
                return Ok(Prepared::Done(Verdict::sidestep(
                    group,
                    None,
                    request_limit,
                    0,
                    self.clock.clone(),
                )));
            }
            return Err(RatelimitError::MissingRate);
        };
        if rate.limit() == 0 {
            return Err(RatelimitError::Disabled(Verdict::sidestep(
                group,
                Some(0),
                1,
                0,
                self.clock.clone(),
            )));
        }
        if let Identity::Precomputed(request_limit) = identity {
            let end = self.clock.now_secs() + u64::from(rate.window_seconds());
            return Ok(Prepared::Done(Verdict::sidestep(
                group,
                Some(rate.limit()),
                request_limit,
                end,
                self.clock.clone(),
            )));
        }

        let cache = query.cache.as_deref().unwrap_or(&self.config.default_cache);
        let store = self
            .stores
            .get(cache)
            .cloned()
            .ok_or_else(|| RatelimitError::Misconfigured(format!("unknown cache: {cache:?}")))?;

        let cache_key = self.derive_key(query, &group, rate, &methods, &identity);
        let epoch = match &query.epoch {
            Some(epoch) => epoch.clone(),
            None => query.request.map(|r| r.epoch()).unwrap_or_default(),
        };
        Ok(Prepared::Counter(CounterCheck {
            group,
            rate,
            cache_key,
            store,
            action: query.action,
            epoch,
        }))
    }

    fn derive_key(
        &self,
        query: &Query<'_>,
        group: &str,
        rate: Rate,
        methods: &MethodFilter,
        identity: &Identity,
    ) -> String {
        let prefix = query.prefix.as_deref().unwrap_or(&self.config.key_prefix);
        let group_digest = self
            .group_memo
            .get_or_insert_with(&group.to_string(), || {
                keys::group_hash(group, self.config.group_hash)
            });
        let parts_digest = match &query.prepared {
            Some(hasher) => hasher.clone().finalize_b64(),
            None => {
                let algo = query.key_hash.unwrap_or(self.config.key_hash);
                let mut hasher = self
                    .parts_memo
                    .get_or_insert_with(&(rate, methods.clone(), algo), || {
                        keys::parts_hasher(rate, methods, algo)
                    });
                if let Identity::Bytes(bytes) = identity {
                    hasher.update(bytes);
                }
                hasher.finalize_b64()
            }
        };
        keys::compose_key(prefix, &group_digest, &parts_digest)
    }

    fn run_blocking(&self, check: CounterCheck) -> Result<Verdict, RatelimitError> {
        let store = check.store.as_blocking();
        let key = &check.cache_key;
        let marker = expire_key(key);
        let window = u64::from(check.rate.window_seconds());
        let ttl = check.rate.window();

        match check.action {
            Action::Peek => {
                let now = self.clock.now_secs();
                match self.live_end(store.get(&marker)?, store, key, &marker)? {
                    Some(end) => {
                        let count = store.get(key)?.unwrap_or(0);
                        Ok(self.verdict(check, count, end))
                    }
                    None => Ok(self.verdict(check, 0, now + window)),
                }
            }
            Action::Increase => {
                for attempt in 1..=MAX_INCREASE_ATTEMPTS {
                    let now = self.clock.now_secs();
                    let live = self.live_end(store.get(&marker)?, store, key, &marker)?;
                    if store.add(key, 1, ttl)? {
                        let end = now + window;
                        store.set(&marker, end as i64, ttl)?;
                        check.epoch.record_increase(key);
                        return Ok(self.verdict(check, 1, end));
                    }
                    match store.increment(key) {
                        Ok(count) => {
                            let end = live.unwrap_or(now + window);
                            check.epoch.record_increase(key);
                            return Ok(self.verdict(check, count, end));
                        }
                        Err(StoreError::Missing) => {
                            debug!(
                                group = %check.group,
                                attempt,
                                "counter evicted between add and increment, retrying"
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                warn!(
                    group = %check.group,
                    attempts = MAX_INCREASE_ATTEMPTS,
                    "store kept losing the counter, giving up"
                );
                Err(RatelimitError::BackendInconsistency { attempts: MAX_INCREASE_ATTEMPTS })
            }
            Action::Reset => {
                let now = self.clock.now_secs();
                let live = self.live_end(store.get(&marker)?, store, key, &marker)?;
                let count = match live {
                    Some(_) => store.get(key)?.unwrap_or(0),
                    None => 0,
                };
                store.delete_many(&[key.clone(), marker])?;
                Ok(self.verdict(check, count, live.unwrap_or(now + window)))
            }
            Action::ResetEpoch => {
                let now = self.clock.now_secs();
                let live = self.live_end(store.get(&marker)?, store, key, &marker)?;
                // The verdict reports the state the caller was subject to,
                // read before the epoch's share is subtracted.
                let count = match live {
                    Some(_) => store.get(key)?.unwrap_or(0),
                    None => 0,
                };
                if check.epoch.is_active() {
                    epoch::reset_epoch(&check.epoch, store, key, self.clock.as_ref())
                        .map_err(RatelimitError::Store)?;
                }
                Ok(self.verdict(check, count, live.unwrap_or(now + window)))
            }
        }
    }

    async fn run_suspending(&self, check: CounterCheck) -> Result<Verdict, RatelimitError> {
        let store = check.store.clone();
        let store = store.as_suspending();
        let key = &check.cache_key;
        let marker = expire_key(key);
        let window = u64::from(check.rate.window_seconds());
        let ttl = check.rate.window();

        match check.action {
            Action::Peek => {
                let now = self.clock.now_secs();
                let end = store.get(&marker).await?;
                match self.live_end_async(end, store, key, &marker).await? {
                    Some(end) => {
                        let count = store.get(key).await?.unwrap_or(0);
                        Ok(self.verdict(check, count, end))
                    }
                    None => Ok(self.verdict(check, 0, now + window)),
                }
            }
            Action::Increase => {
                for attempt in 1..=MAX_INCREASE_ATTEMPTS {
                    let now = self.clock.now_secs();
                    let end = store.get(&marker).await?;
                    let live = self.live_end_async(end, store, key, &marker).await?;
                    if store.add(key, 1, ttl).await? {
                        let end = now + window;
                        store.set(&marker, end as i64, ttl).await?;
                        check.epoch.record_increase(key);
                        return Ok(self.verdict(check, 1, end));
                    }
                    match store.increment(key).await {
                        Ok(count) => {
                            let end = live.unwrap_or(now + window);
                            check.epoch.record_increase(key);
                            return Ok(self.verdict(check, count, end));
                        }
                        Err(StoreError::Missing) => {
                            debug!(
                                group = %check.group,
                                attempt,
                                "counter evicted between add and increment, retrying"
                            );
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                warn!(
                    group = %check.group,
                    attempts = MAX_INCREASE_ATTEMPTS,
                    "store kept losing the counter, giving up"
                );
                Err(RatelimitError::BackendInconsistency { attempts: MAX_INCREASE_ATTEMPTS })
            }
            Action::Reset => {
                let now = self.clock.now_secs();
                let end = store.get(&marker).await?;
                let live = self.live_end_async(end, store, key, &marker).await?;
                let count = match live {
                    Some(_) => store.get(key).await?.unwrap_or(0),
                    None => 0,
                };
                store.delete_many(&[key.clone(), marker]).await?;
                Ok(self.verdict(check, count, live.unwrap_or(now + window)))
            }
            Action::ResetEpoch => {
                let now = self.clock.now_secs();
                let end = store.get(&marker).await?;
                let live = self.live_end_async(end, store, key, &marker).await?;
                let count = match live {
                    Some(_) => store.get(key).await?.unwrap_or(0),
                    None => 0,
                };
                if check.epoch.is_active() {
                    epoch::reset_epoch_async(&check.epoch, store, key, self.clock.as_ref())
                        .await
                        .map_err(RatelimitError::Store)?;
                }
                Ok(self.verdict(check, count, live.unwrap_or(now + window)))
            }
        }
    }

    /// Apply the window-end marker contract: a live marker yields the window
    /// end, an absent or lapsed one means the window elapsed and both keys
    /// are dropped.
    fn live_end(
        &self,
        window_end: Option<i64>,
        store: &dyn CounterStore,
        key: &str,
        marker: &str,
    ) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_secs();
        match window_end {
            Some(end) if end > now as i64 => Ok(Some(end as u64)),
            _ => {
                store.delete_many(&[key.to_string(), marker.to_string()])?;
                Ok(None)
            }
        }
    }

    async fn live_end_async(
        &self,
        window_end: Option<i64>,
        store: &dyn AsyncCounterStore,
        key: &str,
        marker: &str,
    ) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_secs();
        match window_end {
            Some(end) if end > now as i64 => Ok(Some(end as u64)),
            _ => {
                store.delete_many(&[key.to_string(), marker.to_string()]).await?;
                Ok(None)
            }
        }
    }

    fn verdict(&self, check: CounterCheck, count: i64, end: u64) -> Verdict {
        Verdict::counted(
            check.group,
            count,
            check.rate.limit(),
            end,
            check.store,
            check.cache_key,
            self.clock.clone(),
        )
    }
}

impl fmt::Debug for Ratelimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stores: Vec<&String> = self.stores.keys().collect();
        stores.sort();
        f.debug_struct("Ratelimiter")
            .field("config", &self.config)
            .field("stores", &stores)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter() -> (Arc<ManualClock>, Ratelimiter) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = Ratelimiter::with_clock(RatelimiterConfig::new(), clock.clone())
            .with_store("default", store);
        (clock, limiter)
    }

    fn query(rate: &str) -> Query<'static> {
        Query::new("g")
            .key(Identity::bytes("client-1"))
            .rate(RateArg::parse(rate).unwrap())
            .action(Action::Increase)
    }

    #[test]
    fn counts_increase_within_a_window() {
        let (_, limiter) = limiter();
        let first = limiter.get(&query("2/4s")).unwrap();
        assert_eq!((first.count, first.request_limit), (1, 0));
        let second = limiter.get(&query("2/4s")).unwrap();
        assert_eq!((second.count, second.request_limit), (2, 0));
        let third = limiter.get(&query("2/4s")).unwrap();
        assert_eq!((third.count, third.request_limit), (3, 1));
        assert!(!third.allowed());
    }

    #[test]
    fn window_end_is_anchored_at_first_increase() {
        let (clock, limiter) = limiter();
        let first = limiter.get(&query("5/10s")).unwrap();
        assert_eq!(first.end, 1_010);
        clock.advance(7);
        let second = limiter.get(&query("5/10s")).unwrap();
        assert_eq!(second.end, 1_010);
        // Window over: counting restarts with a fresh anchor.
        clock.advance(3);
        let third = limiter.get(&query("5/10s")).unwrap();
        assert_eq!((third.count, third.end), (1, 1_020));
    }

    #[test]
    fn peek_never_counts() {
        let (_, limiter) = limiter();
        limiter.get(&query("2/4s")).unwrap();
        let peek = limiter.get(&query("2/4s").action(Action::Peek)).unwrap();
        assert_eq!(peek.count, 1);
        let peek = limiter.get(&query("2/4s").action(Action::Peek)).unwrap();
        assert_eq!(peek.count, 1);
    }

    #[test]
    fn disabled_engine_bypasses_everything() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter =
            Ratelimiter::with_clock(RatelimiterConfig::new().enabled(false), clock);
        // No store registered; a bypass never needs one.
        let verdict = limiter.get(&query("1/1s")).unwrap();
        assert!(verdict.allowed());
        assert!(!verdict.can_reset());
    }

    #[test]
    fn method_filter_bypasses_nonmatching_requests() {
        use crate::request::SimpleRequest;
        let (_, limiter) = limiter();
        let request = SimpleRequest::new("GET");
        let q = query("1/4s")
            .methods(MethodFilter::of(["POST"]).unwrap())
            .request(&request);
        let verdict = limiter.get(&q).unwrap();
        assert!(verdict.allowed());
        assert!(!verdict.can_reset());
    }

    #[test]
    fn method_filter_without_request_is_rejected() {
        let (_, limiter) = limiter();
        let q = query("1/4s").methods(MethodFilter::safe());
        let err = limiter.get(&q).unwrap_err();
        assert!(matches!(err, RatelimitError::Misconfigured(_)));
    }

    #[test]
    fn zero_limit_is_disabled_before_store_access() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = Ratelimiter::with_clock(RatelimiterConfig::new(), clock);
        let err = limiter.get(&query("0/4s")).unwrap_err();
        let RatelimitError::Disabled(verdict) = err else { panic!("expected Disabled") };
        assert_eq!(verdict.request_limit, 1);
        assert_eq!(verdict.limit, Some(0));
    }

    #[test]
    fn precomputed_identity_sidesteps_the_store() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = Ratelimiter::with_clock(RatelimiterConfig::new(), clock);
        let q = Query::new("g").key(Identity::Precomputed(5)).rate(Rate::new(2, 4).unwrap());
        let verdict = limiter.get(&q).unwrap();
        assert_eq!(verdict.request_limit, 5);
        assert_eq!(verdict.end, 1_004);
        assert!(!verdict.can_reset());

        // Without a rate the sentinel still yields a verdict.
        let q = Query::new("g").key(Identity::Precomputed(0));
        let verdict = limiter.get(&q).unwrap();
        assert!(verdict.allowed());
        assert_eq!(verdict.limit, None);
    }

    #[test]
    fn missing_rate_without_sentinel_is_an_error() {
        let (_, limiter) = limiter();
        let q = Query::new("g").key(Identity::bytes("a")).action(Action::Increase);
        assert!(matches!(limiter.get(&q).unwrap_err(), RatelimitError::MissingRate));
    }

    #[test]
    fn exempt_identity_bypasses_before_rate_resolution() {
        let (_, limiter) = limiter();
        // No rate configured; Exempt must never reach the MissingRate check.
        let q = Query::new("g").key(Identity::Exempt).action(Action::Increase);
        assert!(limiter.get(&q).unwrap().allowed());
    }

    #[test]
    fn unknown_cache_is_rejected() {
        let (_, limiter) = limiter();
        let err = limiter.get(&query("1/4s").cache("redis")).unwrap_err();
        assert!(matches!(err, RatelimitError::Misconfigured(_)));
    }

    #[test]
    fn groups_are_isolated() {
        let (_, limiter) = limiter();
        limiter.get(&query("2/4s")).unwrap();
        let other = limiter
            .get(
                &Query::new("other")
                    .key(Identity::bytes("client-1"))
                    .rate(RateArg::parse("2/4s").unwrap())
                    .action(Action::Increase),
            )
            .unwrap();
        assert_eq!(other.count, 1);
    }

    #[test]
    fn reset_returns_prior_count_and_clears() {
        let (_, limiter) = limiter();
        limiter.get(&query("2/4s")).unwrap();
        limiter.get(&query("2/4s")).unwrap();
        let reset = limiter.get(&query("2/4s").action(Action::Reset)).unwrap();
        assert_eq!(reset.count, 2);
        let fresh = limiter.get(&query("2/4s")).unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[test]
    fn reset_epoch_without_epoch_peeks() {
        let (_, limiter) = limiter();
        limiter.get(&query("2/4s")).unwrap();
        let v = limiter.get(&query("2/4s").action(Action::ResetEpoch)).unwrap();
        assert_eq!(v.count, 1);
        let v = limiter.get(&query("2/4s").action(Action::Peek)).unwrap();
        assert_eq!(v.count, 1);
    }

    #[test]
    fn reset_epoch_subtracts_only_own_increments() {
        let (_, limiter) = limiter();
        let mine = Epoch::ledger();
        let theirs = Epoch::ledger();
        limiter.get(&query("10/4s").epoch(mine.clone())).unwrap();
        limiter.get(&query("10/4s").epoch(mine.clone())).unwrap();
        limiter.get(&query("10/4s").epoch(theirs)).unwrap();
        // The verdict carries the count as it stood before settling.
        let v = limiter
            .get(&query("10/4s").action(Action::ResetEpoch).epoch(mine))
            .unwrap();
        assert_eq!(v.count, 3);
        let v = limiter.get(&query("10/4s").action(Action::Peek)).unwrap();
        assert_eq!(v.count, 1);
    }

    #[test]
    fn empty_identity_falls_back_to_the_configured_substitute() {
        use crate::request::SimpleRequest;
        let (_, limiter) = limiter();
        let request = SimpleRequest::new("GET");
        let empty = || Key::from_fn(|_cx: &ResolveContext<'_>| Ok(Identity::bytes("")));

        // Default substitute: empty bytes count under one shared identity.
        let q = query("5/4s").key(empty()).request(&request);
        assert_eq!(limiter.get(&q).unwrap().count, 1);

        // An exempt substitute bypasses the store.
        let q = query("5/4s").key(empty()).request(&request).empty_to(Identity::Exempt);
        let v = limiter.get(&q).unwrap();
        assert!(v.allowed());
        assert!(!v.can_reset());

        // A precomputed substitute reports its denial without counting.
        let q = query("5/4s").key(empty()).request(&request).empty_to(7u32);
        let v = limiter.get(&q).unwrap();
        assert_eq!(v.request_limit, 7);
        assert!(!v.can_reset());

        // Neither sentinel touched the shared empty-bytes counter.
        let q = query("5/4s").key(empty()).request(&request);
        assert_eq!(limiter.get(&q).unwrap().count, 2);
    }

    #[tokio::test]
    async fn async_pipeline_matches_blocking() {
        let (_, limiter) = limiter();
        let first = limiter.get_async(&query("2/4s")).await.unwrap();
        assert_eq!(first.count, 1);
        let second = limiter.get(&query("2/4s")).unwrap();
        assert_eq!(second.count, 2);
        let third = limiter.get_async(&query("2/4s")).await.unwrap();
        assert_eq!((third.count, third.request_limit), (3, 1));
    }

    #[test]
    fn dynamic_group_and_rate_resolve_per_call() {
        let (_, limiter) = limiter();
        let q = Query::new(GroupArg::dynamic(|_, _| Ok("computed".to_string())))
            .key(Identity::bytes("a"))
            .rate(RateArg::dynamic(|_, group, _| {
                assert_eq!(group, "computed");
                Rate::new(3, 4)
            }))
            .action(Action::Increase);
        let verdict = limiter.get(&q).unwrap();
        assert_eq!(verdict.group, "computed");
        assert_eq!(verdict.limit, Some(3));
    }

    #[test]
    fn prepared_hasher_matches_full_derivation() {
        let (_, limiter) = limiter();
        let rate = Rate::new(2, 4).unwrap();
        let methods = MethodFilter::all();
        let mut hasher = keys::parts_hasher(rate, &methods, HashAlgo::Sha256);
        hasher.update(b"client-1");

        let plain = limiter.get(&query("2/4s")).unwrap();
        let via_prepared = limiter.get(&query("2/4s").prepared(hasher)).unwrap();
        // Same derived key: the second check continues the first's counter.
        assert_eq!(via_prepared.count, plain.count + 1);
    }
}
