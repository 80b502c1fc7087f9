//! Cache-key derivation: stable, collision-resistant, length-bounded.
//!
//! A derived key has the shape
//! `<prefix><b64(hash(group))>:<b64(hash(window, filter sign, sorted methods, identity))>`.
//! The group name is hashed rather than embedded raw so key length stays
//! bounded no matter what callers use as group names; backends commonly cap
//! key length around 250 bytes. This is a load-bearing invariant, not an
//! optimization.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256, Sha512};

use crate::methods::MethodFilter;
use crate::rate::Rate;

/// Hash algorithm used for cache-key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HashAlgo {
    #[default]
    Sha256,
    Sha512,
}

/// A resumable hash context for cache-key parts.
///
/// Cloneable so a context prepared once (window, method filter, maybe a
/// static identity) can be reused across calls.
#[derive(Clone)]
pub enum KeyHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl KeyHasher {
    pub fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgo::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_b64(self) -> String {
        match self {
            Self::Sha256(h) => URL_SAFE_NO_PAD.encode(h.finalize()),
            Self::Sha512(h) => URL_SAFE_NO_PAD.encode(h.finalize()),
        }
    }
}

impl fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256(_) => f.write_str("KeyHasher::Sha256"),
            Self::Sha512(_) => f.write_str("KeyHasher::Sha512"),
        }
    }
}

/// Hash of the group name, bounding key length independent of group length.
pub(crate) fn group_hash(group: &str, algo: HashAlgo) -> String {
    let mut hasher = KeyHasher::new(algo);
    hasher.update(group.as_bytes());
    hasher.finalize_b64()
}

/// Part hasher seeded with the window size and the method filter shape.
///
/// The filter's sign and sorted member names are both mixed in so the
/// universal filter, a safe-method filter, and explicit sets never collide.
pub(crate) fn parts_hasher(rate: Rate, methods: &MethodFilter, algo: HashAlgo) -> KeyHasher {
    let mut hasher = KeyHasher::new(algo);
    hasher.update(rate.window_seconds().to_string().as_bytes());
    hasher.update(&[methods.sign_byte()]);
    hasher.update(methods.joined_sorted().as_bytes());
    hasher
}

pub(crate) fn compose_key(prefix: &str, group_digest: &str, parts_digest: &str) -> String {
    format!("{prefix}{group_digest}:{parts_digest}")
}

/// Window-end marker key paired with a counter key.
pub(crate) fn expire_key(cache_key: &str) -> String {
    format!("{cache_key}_expire")
}

/// Derive the full cache key for one check.
///
/// Deterministic: identical inputs always produce the identical key.
pub fn derive_cache_key(
    prefix: &str,
    group: &str,
    rate: Rate,
    methods: &MethodFilter,
    identity: &[u8],
    key_algo: HashAlgo,
    group_algo: HashAlgo,
) -> String {
    let mut hasher = parts_hasher(rate, methods, key_algo);
    hasher.update(identity);
    compose_key(prefix, &group_hash(group, group_algo), &hasher.finalize_b64())
}

/// Bounded memoization map owned by an engine instance.
///
/// Cleared wholesale when full; rebuilding the engine invalidates it, which
/// replaces the original design's module-level memo caches surviving across
/// configuration reloads.
pub(crate) struct BoundedMemo<K, V> {
    capacity: usize,
    map: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedMemo<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity, map: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn get_or_insert_with(&self, key: &K, init: impl FnOnce() -> V) -> V {
        let mut map = self.map.lock().unwrap();
        if let Some(value) = map.get(key) {
            return value.clone();
        }
        let value = init();
        if map.len() >= self.capacity {
            map.clear();
        }
        map.insert(key.clone(), value.clone());
        value
    }
}
