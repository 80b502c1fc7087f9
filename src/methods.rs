//! HTTP method filters with complement ("all except") semantics.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::RatelimitError;
use crate::request::RequestContext;
use crate::verdict::Action;

/// A set of uppercase HTTP method names, or its complement.
///
/// The universal filter is the inverted empty set: it matches everything.
/// The sign and the sorted member list are mixed into the cache-key hash so
/// that `ALL`, `SAFE`, and custom sets never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodFilter {
    methods: BTreeSet<String>,
    inverted: bool,
}

impl MethodFilter {
    /// Matches every method.
    pub fn all() -> Self {
        Self { methods: BTreeSet::new(), inverted: true }
    }

    /// GET, HEAD and OPTIONS.
    pub fn safe() -> Self {
        Self {
            methods: ["GET", "HEAD", "OPTIONS"].into_iter().map(String::from).collect(),
            inverted: false,
        }
    }

    /// Everything except GET, HEAD and OPTIONS.
    pub fn unsafe_methods() -> Self {
        let mut filter = Self::safe();
        filter.inverted = true;
        filter
    }

    /// An explicit set of method names. Lowercase names are a contract violation.
    pub fn of<I, S>(methods: I) -> Result<Self, RatelimitError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods: BTreeSet<String> = methods.into_iter().map(Into::into).collect();
        for method in &methods {
            if method.chars().any(|c| c.is_ascii_lowercase()) {
                return Err(RatelimitError::Misconfigured(format!(
                    "method name must be uppercase: {method:?}"
                )));
            }
        }
        Ok(Self { methods, inverted: false })
    }

    /// The complement of an explicit set: matches every method not named.
    pub fn all_except<I, S>(methods: I) -> Result<Self, RatelimitError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filter = Self::of(methods)?;
        filter.inverted = true;
        Ok(filter)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains(method) != self.inverted
    }

    pub fn is_all(&self) -> bool {
        self.inverted && self.methods.is_empty()
    }

    /// Sign marker mixed into the cache-key hash.
    pub(crate) fn sign_byte(&self) -> u8 {
        if self.inverted {
            b'i'
        } else {
            b'n'
        }
    }

    /// Sorted member names, concatenated, for the cache-key hash.
    pub(crate) fn joined_sorted(&self) -> String {
        self.methods.iter().map(String::as_str).collect()
    }
}

/// Callback resolving a method filter from the request, group, and action.
pub type MethodsFn =
    dyn Fn(Option<&dyn RequestContext>, &str, Action) -> Result<MethodFilter, RatelimitError>
        + Send
        + Sync;

/// How a method filter is supplied to the engine.
#[derive(Clone)]
pub enum MethodsArg {
    Fixed(MethodFilter),
    Dynamic(Arc<MethodsFn>),
}

impl MethodsArg {
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(Option<&dyn RequestContext>, &str, Action) -> Result<MethodFilter, RatelimitError>
            + Send
            + Sync
            + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    pub(crate) fn resolve(
        &self,
        request: Option<&dyn RequestContext>,
        group: &str,
        action: Action,
    ) -> Result<MethodFilter, RatelimitError> {
        match self {
            Self::Fixed(filter) => Ok(filter.clone()),
            Self::Dynamic(f) => f(request, group, action),
        }
    }
}

impl Default for MethodsArg {
    fn default() -> Self {
        Self::Fixed(MethodFilter::all())
    }
}

impl From<MethodFilter> for MethodsArg {
    fn from(filter: MethodFilter) -> Self {
        Self::Fixed(filter)
    }
}

impl fmt::Debug for MethodsArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(filter) => f.debug_tuple("Fixed").field(filter).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_matches_everything() {
        let all = MethodFilter::all();
        assert!(all.is_all());
        assert!(all.contains("GET"));
        assert!(all.contains("BREW"));
    }

    #[test]
    fn explicit_set_membership() {
        let filter = MethodFilter::of(["POST", "PUT"]).unwrap();
        assert!(filter.contains("POST"));
        assert!(!filter.contains("GET"));
        assert!(!filter.is_all());
    }

    #[test]
    fn inverted_set_negates_membership() {
        let filter = MethodFilter::all_except(["POST"]).unwrap();
        assert!(!filter.contains("POST"));
        assert!(filter.contains("GET"));
        assert!(!filter.is_all());
    }

    #[test]
    fn unsafe_is_the_complement_of_safe() {
        let safe = MethodFilter::safe();
        let not_safe = MethodFilter::unsafe_methods();
        for method in ["GET", "HEAD", "OPTIONS", "POST", "DELETE"] {
            assert_eq!(safe.contains(method), !not_safe.contains(method));
        }
    }

    #[test]
    fn lowercase_names_are_rejected() {
        assert!(matches!(
            MethodFilter::of(["get"]),
            Err(RatelimitError::Misconfigured(_))
        ));
    }

    #[test]
    fn hash_parts_distinguish_sign() {
        let explicit = MethodFilter::of(["GET", "POST"]).unwrap();
        let complement = MethodFilter::all_except(["GET", "POST"]).unwrap();
        assert_eq!(explicit.joined_sorted(), complement.joined_sorted());
        assert_ne!(explicit.sign_byte(), complement.sign_byte());
        assert_eq!(explicit.joined_sorted(), "GETPOST");
    }
}
