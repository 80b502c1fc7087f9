#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # fastlimit
//!
//! Request-level rate limiting on fixed-window counters: a small engine plus
//! composable key strategies, usable standalone or as a tower layer.
//!
//! ## Features
//!
//! - **Fixed-window counters** anchored at first increment, with early-expiry
//!   detection for backends that evict eagerly
//! - **Key strategies** composed from request facets (client network, user,
//!   session, headers, parameters) or a compact string grammar
//! - **Identity sentinels** for exempting, grouping, or precomputing verdicts
//!   without touching the store
//! - **Epoch-scoped undo** subtracting exactly one request's increments
//! - **Verdict merging** so stacked checks surface one result per request
//! - **Sync and async** forms of every store-touching operation, plus a
//!   tower `Layer`
//!
//! ## Quick Start
//!
//! ```rust
//! use fastlimit::{
//!     Key, Ratelimiter, RatelimiterConfig, RatelimitGuard, RateArg, SimpleRequest,
//! };
//!
//! let limiter = Ratelimiter::new(RatelimiterConfig::new());
//! let guard = RatelimitGuard::new("login")
//!     .key(Key::parse("ip").unwrap())
//!     .rate(RateArg::parse("5/m").unwrap())
//!     .block(false);
//!
//! let request = SimpleRequest::new("POST").with_peer_addr("203.0.113.9");
//! let verdict = guard.enforce(&limiter, &request).unwrap();
//! assert!(verdict.allowed());
//! ```

pub mod clock;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod identity;
pub mod ip;
pub mod keys;
pub mod methods;
pub mod middleware;
pub mod rate;
pub mod request;
pub mod store;
pub mod strategies;
pub mod verdict;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{GroupArg, Query, Ratelimiter, RatelimiterConfig};
pub use epoch::{Epoch, EpochLedger};
pub use error::RatelimitError;
pub use identity::Identity;
pub use ip::{client_ip, NetMask, TrustedProxies};
pub use keys::{derive_cache_key, HashAlgo, KeyHasher};
pub use methods::{MethodFilter, MethodsArg};
pub use middleware::{GateError, RatelimitGuard, RatelimitLayer, RatelimitService};
pub use rate::{Rate, RateArg};
pub use request::{RequestContext, SimpleRequest};
pub use store::{AsyncCounterStore, CounterStore, MemoryStore, Store, StoreError};
pub use strategies::{
    FieldsKey, IpExemptPrivilegedKey, IpExemptUserKey, Key, KeyStrategy, ResolveContext,
    StaticKey, UserOrIpKey,
};
pub use verdict::{Action, Verdict, VerdictMap};
