//! Guard configuration and the tower integration.
//!
//! A [`RatelimitGuard`] is the declarative counterpart of one protected
//! call site: which group, key, and rate apply, whether a denied check
//! blocks, waits, or merely records. Guards enforce directly via
//! [`enforce`](RatelimitGuard::enforce)/[`enforce_async`](RatelimitGuard::enforce_async),
//! or sit in a tower stack through [`RatelimitLayer`].

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;

use crate::engine::{GroupArg, Query, Ratelimiter};
use crate::error::RatelimitError;
use crate::identity::Identity;
use crate::keys::{self, KeyHasher};
use crate::methods::MethodsArg;
use crate::rate::RateArg;
use crate::request::RequestContext;
use crate::store::StoreError;
use crate::strategies::Key;
use crate::verdict::{Action, Verdict};

/// Per-call-site enforcement settings.
///
/// Defaults: group-wide key, no rate, all methods, `block` on, no waiting,
/// verdicts merged (not replaced) under the `"ratelimit"` name.
#[derive(Debug, Clone)]
pub struct RatelimitGuard {
    group: GroupArg,
    key: Key,
    rate: RateArg,
    methods: MethodsArg,
    cache: Option<String>,
    block: bool,
    replace: bool,
    wait: bool,
    decorate_name: String,
    prepared: Option<KeyHasher>,
}

impl RatelimitGuard {
    pub fn new(group: impl Into<GroupArg>) -> Self {
        Self {
            group: group.into(),
            key: Key::Static(Identity::Group),
            rate: RateArg::Missing,
            methods: MethodsArg::default(),
            cache: None,
            block: true,
            replace: false,
            wait: false,
            decorate_name: "ratelimit".to_string(),
            prepared: None,
        }
    }

    pub fn key(mut self, key: impl Into<Key>) -> Self {
        self.key = key.into();
        self.prepared = None;
        self
    }

    pub fn rate(mut self, rate: impl Into<RateArg>) -> Self {
        self.rate = rate.into();
        self.prepared = None;
        self
    }

    pub fn methods(mut self, methods: impl Into<MethodsArg>) -> Self {
        self.methods = methods.into();
        self.prepared = None;
        self
    }

    pub fn cache(mut self, name: impl Into<String>) -> Self {
        self.cache = Some(name.into());
        self
    }

    /// Whether a denied check surfaces as [`RatelimitError::Exceeded`].
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Overwrite the verdict slot instead of merging into it.
    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    /// Suspend until the window ends before signalling a denied check.
    /// Honored only by the async form.
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Name of the verdict slot this guard binds into.
    pub fn decorate_name(mut self, name: impl Into<String>) -> Self {
        self.decorate_name = name.into();
        self
    }

    /// Pre-hash the static parts of the cache key against `limiter`'s
    /// configuration. Applies when rate, methods, and key are all fixed;
    /// otherwise a no-op. Re-bind after changing any of them.
    pub fn bind(mut self, limiter: &Ratelimiter) -> Self {
        let (RateArg::Fixed(rate), MethodsArg::Fixed(methods)) = (&self.rate, &self.methods)
        else {
            return self;
        };
        let identity: &[u8] = match &self.key {
            Key::Static(Identity::Bytes(bytes)) => bytes,
            Key::Static(Identity::Group) => &[],
            _ => return self,
        };
        let mut hasher = keys::parts_hasher(*rate, methods, limiter.key_hash_algo());
        hasher.update(identity);
        self.prepared = Some(hasher);
        self
    }

    fn query<'r>(&self, request: &'r dyn RequestContext) -> Query<'r> {
        let mut query = Query::new(self.group.clone())
            .key(self.key.clone())
            .rate(self.rate.clone())
            .methods(self.methods.clone())
            .action(Action::Increase)
            .request(request);
        if let Some(cache) = &self.cache {
            query = query.cache(cache.clone());
        }
        if let Some(prepared) = &self.prepared {
            query = query.prepared(prepared.clone());
        }
        query
    }

    fn merge(&self, request: &dyn RequestContext, verdict: Verdict) -> Verdict {
        request.verdicts().merge(&self.decorate_name, verdict, self.replace)
    }

    /// Count this request and bind the merged verdict into its slot.
    ///
    /// A denied check returns [`RatelimitError::Exceeded`] when `block` is
    /// set; otherwise the denial is visible only on the returned verdict.
    /// `Disabled` still binds its carried verdict before propagating.
    pub fn enforce(
        &self,
        limiter: &Ratelimiter,
        request: &dyn RequestContext,
    ) -> Result<Verdict, RatelimitError> {
        let verdict = match limiter.get(&self.query(request)) {
            Ok(verdict) => verdict,
            Err(RatelimitError::Disabled(verdict)) => {
                let merged = self.merge(request, verdict);
                return Err(RatelimitError::Disabled(merged));
            }
            Err(e) => return Err(e),
        };
        let merged = self.merge(request, verdict);
        merged.check(self.block)?;
        Ok(merged)
    }

    /// Awaitable twin of [`enforce`](Self::enforce); additionally honors
    /// `wait`.
    pub async fn enforce_async(
        &self,
        limiter: &Ratelimiter,
        request: &dyn RequestContext,
    ) -> Result<Verdict, RatelimitError> {
        let verdict = match limiter.get_async(&self.query(request)).await {
            Ok(verdict) => verdict,
            Err(RatelimitError::Disabled(verdict)) => {
                let merged = self.merge(request, verdict);
                return Err(RatelimitError::Disabled(merged));
            }
            Err(e) => return Err(e),
        };
        let merged = self.merge(request, verdict);
        merged.wait_and_check(self.wait, self.block).await?;
        Ok(merged)
    }
}

/// Error type of a [`RatelimitService`] stack.
#[derive(Debug, thiserror::Error)]
pub enum GateError<E: std::error::Error> {
    #[error(transparent)]
    Ratelimit(#[from] RatelimitError),
    #[error(transparent)]
    Inner(E),
}

impl<E: std::error::Error> GateError<E> {
    /// Check if the gate itself denied the call.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Ratelimit(e) if e.is_exceeded())
    }
}

impl<E: std::error::Error> From<StoreError> for GateError<E> {
    fn from(e: StoreError) -> Self {
        Self::Ratelimit(e.into())
    }
}

/// A layer gating every call through one guard.
#[derive(Debug, Clone)]
pub struct RatelimitLayer {
    limiter: Arc<Ratelimiter>,
    guard: Arc<RatelimitGuard>,
}

impl RatelimitLayer {
    pub fn new(limiter: Arc<Ratelimiter>, guard: RatelimitGuard) -> Self {
        let guard = guard.bind(&limiter);
        Self { limiter, guard: Arc::new(guard) }
    }
}

impl<S> Layer<S> for RatelimitLayer {
    type Service = RatelimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RatelimitService {
            inner: service,
            limiter: self.limiter.clone(),
            guard: self.guard.clone(),
        }
    }
}

/// Middleware service counting each call before handing it to `inner`.
#[derive(Debug, Clone)]
pub struct RatelimitService<S> {
    inner: S,
    limiter: Arc<Ratelimiter>,
    guard: Arc<RatelimitGuard>,
}

impl<S, Req> Service<Req> for RatelimitService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    Req: RequestContext + Send + 'static,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let guard = self.guard.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            guard.enforce_async(&limiter, &req).await?;
            inner.call(req).await.map_err(GateError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::RatelimiterConfig;
    use crate::rate::Rate;
    use crate::request::SimpleRequest;
    use crate::store::MemoryStore;

    fn limiter() -> Ratelimiter {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Ratelimiter::with_clock(RatelimiterConfig::new(), clock).with_store("default", store)
    }

    fn guard(rate: &str) -> RatelimitGuard {
        RatelimitGuard::new("login")
            .key(Key::parse("ip").unwrap())
            .rate(RateArg::parse(rate).unwrap())
    }

    #[test]
    fn enforce_binds_the_verdict() {
        let limiter = limiter();
        let request = SimpleRequest::new("POST").with_peer_addr("1.2.3.4");
        let verdict = guard("2/4s").enforce(&limiter, &request).unwrap();
        assert_eq!(verdict.count, 1);
        assert_eq!(request.verdicts().get("ratelimit").unwrap(), verdict);
    }

    #[test]
    fn blocking_guard_raises_on_denial() {
        let limiter = limiter();
        let g = guard("1/4s");
        let request = SimpleRequest::new("POST").with_peer_addr("1.2.3.4");
        g.enforce(&limiter, &request).unwrap();
        let err = g.enforce(&limiter, &request).unwrap_err();
        assert!(err.is_exceeded());
        // The denial is bound in the slot regardless of the error path.
        assert!(!request.verdicts().get("ratelimit").unwrap().allowed());
    }

    #[test]
    fn non_blocking_guard_reports_through_the_slot() {
        let limiter = limiter();
        let g = guard("1/4s").block(false);
        let request = SimpleRequest::new("POST").with_peer_addr("1.2.3.4");
        g.enforce(&limiter, &request).unwrap();
        let verdict = g.enforce(&limiter, &request).unwrap();
        assert!(!verdict.allowed());
    }

    #[test]
    fn stacked_guards_merge_into_one_slot() {
        let limiter = limiter();
        let burst = guard("1/4s").block(false);
        let sustained = RatelimitGuard::new("login-sustained")
            .key(Key::parse("ip").unwrap())
            .rate(Rate::new(100, 60).unwrap())
            .block(false);
        let request = SimpleRequest::new("POST").with_peer_addr("1.2.3.4");
        burst.enforce(&limiter, &request).unwrap();
        sustained.enforce(&limiter, &request).unwrap();
        burst.enforce(&limiter, &request).unwrap();
        sustained.enforce(&limiter, &request).unwrap();
        // The burst denial wins the merged slot over the sustained allowance.
        assert!(!request.verdicts().get("ratelimit").unwrap().allowed());
    }

    #[test]
    fn zero_rate_binds_before_propagating() {
        let limiter = limiter();
        let g = guard("0/4s");
        let request = SimpleRequest::new("POST").with_peer_addr("1.2.3.4");
        let err = g.enforce(&limiter, &request).unwrap_err();
        assert!(err.is_disabled());
        assert!(!request.verdicts().get("ratelimit").unwrap().allowed());
    }

    #[test]
    fn bind_prepares_only_fully_fixed_guards() {
        let limiter = limiter();
        let fixed = RatelimitGuard::new("g")
            .key(Identity::bytes("tenant"))
            .rate(Rate::new(2, 4).unwrap())
            .bind(&limiter);
        assert!(fixed.prepared.is_some());

        let dynamic = guard("2/4s").bind(&limiter);
        assert!(dynamic.prepared.is_none());
    }

    #[test]
    fn bound_and_unbound_guards_share_a_counter() {
        let limiter = limiter();
        let unbound =
            RatelimitGuard::new("g").key(Identity::bytes("tenant")).rate(Rate::new(5, 4).unwrap());
        let bound = unbound.clone().bind(&limiter);
        let request = SimpleRequest::new("GET");
        assert_eq!(unbound.enforce(&limiter, &request).unwrap().count, 1);
        assert_eq!(bound.enforce(&limiter, &request).unwrap().count, 2);
    }

    #[tokio::test]
    async fn async_enforcement_matches_blocking() {
        let limiter = limiter();
        let g = guard("2/4s");
        let request = SimpleRequest::new("POST").with_peer_addr("1.2.3.4");
        g.enforce(&limiter, &request).unwrap();
        let verdict = g.enforce_async(&limiter, &request).await.unwrap();
        assert_eq!(verdict.count, 2);
    }
}
