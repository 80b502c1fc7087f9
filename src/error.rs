//! Error taxonomy for the rate limiting engine.
//!
//! Semantics:
//! - `InvalidFormat`/`InvalidRate`/`MissingRate`/`Misconfigured` are programmer or
//!   configuration errors surfaced at parse or call time, never retried.
//! - `Disabled` and `Exceeded` are expected control-flow signals carrying the full
//!   [`Verdict`] so callers can branch without losing information.
//! - `BackendInconsistency` means the store raced past the bounded retry budget:
//!   the backend is misbehaving or overloaded.
//!
//! Nothing is swallowed inside the engine: every check ends in a verdict or one of
//! these typed failures.

use crate::store::StoreError;
use crate::verdict::Verdict;

/// Unified error type for rate limit checks.
#[derive(Debug, thiserror::Error)]
pub enum RatelimitError {
    /// A rate string did not match `count[/multiplier][unit]`.
    #[error("invalid rate format: {0:?}")]
    InvalidFormat(String),
    /// A rate shape with a zero window.
    #[error("invalid rate: limit {limit}, window {window_seconds}s")]
    InvalidRate { limit: u32, window_seconds: u32 },
    /// A rate was required but absent and the key strategy cannot supply a
    /// verdict on its own.
    #[error("rate missing and key strategy is not self-sufficient")]
    MissingRate,
    /// The caller violated a configuration contract.
    #[error("misconfigured: {0}")]
    Misconfigured(String),
    /// The client address could not be determined.
    #[error("could not determine client ip address")]
    MissingIp,
    /// The limit is exactly zero: always deny, without touching the store.
    #[error("ratelimit disabled by zero rate for group {}", .0.group)]
    Disabled(Verdict),
    /// The check was denied and blocking was requested.
    #[error("ratelimit exceeded for group {}", .0.group)]
    Exceeded(Verdict),
    /// The counter vanished between add and increment more times than the
    /// retry budget allows.
    #[error("store inconsistent after {attempts} increase attempts")]
    BackendInconsistency { attempts: u32 },
    /// The backing store failed.
    #[error("store error")]
    Store(#[from] StoreError),
}

impl RatelimitError {
    /// Check if this error signals a denied-and-blocked check.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded(_))
    }

    /// Check if this error signals a zero-rate group.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled(_))
    }

    /// Check if this error came from the backing store.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_) | Self::BackendInconsistency { .. })
    }

    /// The verdict carried by `Disabled` and `Exceeded` signals.
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            Self::Disabled(v) | Self::Exceeded(v) => Some(v),
            _ => None,
        }
    }

    /// Consume the error, extracting the carried verdict if present.
    pub fn into_verdict(self) -> Option<Verdict> {
        match self {
            Self::Disabled(v) | Self::Exceeded(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_format_display() {
        let err = RatelimitError::InvalidFormat("1/x".into());
        let msg = format!("{}", err);
        assert!(msg.contains("invalid rate format"));
        assert!(msg.contains("1/x"));
    }

    #[test]
    fn backend_inconsistency_display_includes_attempts() {
        let err = RatelimitError::BackendInconsistency { attempts: 3 };
        assert!(format!("{}", err).contains('3'));
    }

    #[test]
    fn predicates_cover_variants() {
        assert!(RatelimitError::BackendInconsistency { attempts: 3 }.is_store());
        assert!(RatelimitError::Store(StoreError::Missing).is_store());
        assert!(!RatelimitError::MissingRate.is_store());
        assert!(!RatelimitError::MissingRate.is_exceeded());
        assert!(RatelimitError::MissingRate.verdict().is_none());
    }
}
