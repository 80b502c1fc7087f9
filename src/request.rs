//! The request collaborator interface consumed by key strategies and the
//! middleware.

use std::collections::HashMap;
use std::sync::Arc;

use crate::epoch::{Epoch, EpochLedger};
use crate::verdict::VerdictMap;

/// Read access to the facts of one inbound request, plus the one associative
/// slot the engine needs for verdict binding.
///
/// Implement this for your framework's request type. Every accessor except
/// [`method`](Self::method), [`peer_addr`](Self::peer_addr) and
/// [`verdicts`](Self::verdicts) has a do-nothing default.
pub trait RequestContext: Send + Sync {
    /// Uppercase HTTP method name.
    fn method(&self) -> &str;

    /// Transport peer address, before trusted-proxy resolution.
    fn peer_addr(&self) -> Option<&str>;

    /// Raw `Forwarded` header.
    fn forwarded(&self) -> Option<&str> {
        None
    }

    /// Raw `X-Forwarded-For` header.
    fn forwarded_for(&self) -> Option<&str> {
        None
    }

    /// Authenticated user identifier.
    fn user_id(&self) -> Option<&str> {
        None
    }

    /// Whether the authenticated user may reset counters.
    fn user_is_privileged(&self) -> bool {
        false
    }

    /// Session identifier, if a session exists.
    fn session_id(&self) -> Option<&str> {
        None
    }

    /// A value stored in the session.
    fn session_value(&self, _name: &str) -> Option<String> {
        None
    }

    fn header(&self, _name: &str) -> Option<String> {
        None
    }

    fn query_param(&self, _name: &str) -> Option<String> {
        None
    }

    fn form_param(&self, _name: &str) -> Option<String> {
        None
    }

    /// The per-request slot map where verdicts are bound and merged.
    fn verdicts(&self) -> &VerdictMap;

    /// The epoch increments on behalf of this request are attributed to.
    fn epoch(&self) -> Epoch {
        Epoch::None
    }
}

/// Owned request facts for embedders without a framework, and for tests.
///
/// Header, query, form, and session lookups are exact-match on the stored
/// name; header names are lowercased on insertion and lookup.
#[derive(Debug, Default)]
pub struct SimpleRequest {
    method: String,
    peer_addr: Option<String>,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
    session: HashMap<String, String>,
    session_id: Option<String>,
    user_id: Option<String>,
    privileged: bool,
    verdicts: VerdictMap,
    epoch: Arc<EpochLedger>,
}

impl SimpleRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), ..Self::default() }
    }

    pub fn with_peer_addr(mut self, addr: impl Into<String>) -> Self {
        self.peer_addr = Some(addr.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_form_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.insert(name.into(), value.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_session_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.session.insert(name.into(), value.into());
        self
    }

    pub fn with_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_privileged_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self.privileged = true;
        self
    }
}

impl RequestContext for SimpleRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn peer_addr(&self) -> Option<&str> {
        self.peer_addr.as_deref()
    }

    fn forwarded(&self) -> Option<&str> {
        self.headers.get("forwarded").map(String::as_str)
    }

    fn forwarded_for(&self) -> Option<&str> {
        self.headers.get("x-forwarded-for").map(String::as_str)
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn user_is_privileged(&self) -> bool {
        self.privileged
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn session_value(&self, name: &str) -> Option<String> {
        self.session.get(name).cloned()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_ascii_lowercase()).cloned()
    }

    fn query_param(&self, name: &str) -> Option<String> {
        self.query.get(name).cloned()
    }

    fn form_param(&self, name: &str) -> Option<String> {
        self.form.get(name).cloned()
    }

    fn verdicts(&self) -> &VerdictMap {
        &self.verdicts
    }

    fn epoch(&self) -> Epoch {
        Epoch::Ledger(Arc::clone(&self.epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = SimpleRequest::new("GET").with_header("X-Api-Key", "abc");
        assert_eq!(req.header("x-api-key").as_deref(), Some("abc"));
        assert_eq!(req.header("X-API-KEY").as_deref(), Some("abc"));
        assert_eq!(req.header("other"), None);
    }

    #[test]
    fn epoch_is_stable_per_request() {
        let req = SimpleRequest::new("GET");
        let (Epoch::Ledger(a), Epoch::Ledger(b)) = (req.epoch(), req.epoch()) else {
            panic!("expected ledger epochs");
        };
        assert!(Arc::ptr_eq(&a, &b));
    }
}
