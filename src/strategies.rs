//! Composable key-derivation strategies.
//!
//! A strategy turns a request into an [`Identity`]. Strategies are resolved
//! once at configuration time into a single object; the engine only ever
//! calls [`KeyStrategy::resolve`].
//!
//! # Configuration grammar
//!
//! [`Key::parse`] accepts either a dedicated combinator:
//!
//! - `static[:value]`
//! - `user_or_ip[:mask]`
//! - `ip_exempt_user[:mask]`
//! - `ip_exempt_privileged[:mask]`
//!
//! or a comma-joined list of facets collected into one identity:
//!
//! - `ip[:mask]`, `user`, `session[:name]`, `header:name`, `get:name`,
//!   `post:name`
//!
//! `user_and_ip[:mask]` is shorthand for `ip[:mask],user`. Masks are `N`
//! (an IPv6 prefix applied in the mapped domain) or `V4/V6` (per-family
//! prefixes, see [`NetMask`]).
//!
//! The exemption combinators XOR their predicate with "the action is a
//! reset": exempt callers are not counted, but on RESET/RESET_EPOCH the
//! polarity flips so they may reset others' counters while ordinary callers
//! cannot.

use std::fmt;
use std::sync::Arc;

use crate::error::RatelimitError;
use crate::identity::Identity;
use crate::ip::{client_ip, NetMask, TrustedProxies};
use crate::request::RequestContext;
use crate::verdict::Action;

/// Everything a strategy may consult while resolving.
pub struct ResolveContext<'a> {
    pub request: &'a dyn RequestContext,
    pub group: &'a str,
    pub action: Action,
    pub trusted_proxies: &'a TrustedProxies,
}

/// A pure identity-derivation strategy.
pub trait KeyStrategy: Send + Sync {
    fn resolve(&self, cx: &ResolveContext<'_>) -> Result<Identity, RatelimitError>;

    /// Whether resolution may block (database lookups and the like).
    /// Blocking strategies are moved off the cooperative scheduler by the
    /// async engine.
    fn is_blocking(&self) -> bool {
        false
    }
}

/// Adapter turning a plain closure into a strategy.
struct FnStrategy<F>(F);

impl<F> KeyStrategy for FnStrategy<F>
where
    F: Fn(&ResolveContext<'_>) -> Result<Identity, RatelimitError> + Send + Sync,
{
    fn resolve(&self, cx: &ResolveContext<'_>) -> Result<Identity, RatelimitError> {
        (self.0)(cx)
    }
}

/// Key argument accepted by the engine.
#[derive(Clone)]
pub enum Key {
    /// A fixed identity value.
    Static(Identity),
    /// A strategy resolved per call.
    Strategy(Arc<dyn KeyStrategy>),
}

impl Key {
    /// Parse the configuration grammar (see module docs).
    pub fn parse(spec: &str) -> Result<Self, RatelimitError> {
        Ok(Self::Strategy(parse_strategy(spec)?))
    }

    pub fn strategy(strategy: impl KeyStrategy + 'static) -> Self {
        Self::Strategy(Arc::new(strategy))
    }

    /// A strategy from a plain closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ResolveContext<'_>) -> Result<Identity, RatelimitError> + Send + Sync + 'static,
    {
        Self::Strategy(Arc::new(FnStrategy(f)))
    }
}

impl From<Identity> for Key {
    fn from(identity: Identity) -> Self {
        Self::Static(identity)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(identity) => f.debug_tuple("Static").field(identity).finish(),
            Self::Strategy(_) => f.write_str("Strategy(..)"),
        }
    }
}

fn masked_ip(cx: &ResolveContext<'_>, mask: NetMask) -> Result<String, RatelimitError> {
    Ok(mask.apply(client_ip(cx.request, cx.trusted_proxies)?).to_string())
}

/// Fixed identity regardless of request.
#[derive(Debug, Clone)]
pub struct StaticKey(Identity);

impl StaticKey {
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self(identity.into())
    }
}

impl Default for StaticKey {
    fn default() -> Self {
        Self(Identity::bytes("static"))
    }
}

impl KeyStrategy for StaticKey {
    fn resolve(&self, _cx: &ResolveContext<'_>) -> Result<Identity, RatelimitError> {
        Ok(self.0.clone())
    }
}

/// User id when authenticated, masked client network otherwise.
#[derive(Debug, Clone, Copy)]
pub struct UserOrIpKey {
    mask: NetMask,
}

impl UserOrIpKey {
    pub fn new(mask: NetMask) -> Self {
        Self { mask }
    }
}

impl Default for UserOrIpKey {
    fn default() -> Self {
        Self { mask: NetMask::host() }
    }
}

impl KeyStrategy for UserOrIpKey {
    fn resolve(&self, cx: &ResolveContext<'_>) -> Result<Identity, RatelimitError> {
        if let Some(user) = cx.request.user_id() {
            return Ok(Identity::bytes(user));
        }
        Ok(Identity::bytes(masked_ip(cx, self.mask)?))
    }
}

/// Count anonymous callers by network; authenticated users are exempt from
/// counting but may run resets (the polarity flips on reset actions).
#[derive(Debug, Clone, Copy)]
pub struct IpExemptUserKey {
    mask: NetMask,
}

impl IpExemptUserKey {
    pub fn new(mask: NetMask) -> Self {
        Self { mask }
    }
}

impl Default for IpExemptUserKey {
    fn default() -> Self {
        Self { mask: NetMask::host() }
    }
}

impl KeyStrategy for IpExemptUserKey {
    fn resolve(&self, cx: &ResolveContext<'_>) -> Result<Identity, RatelimitError> {
        if cx.request.user_id().is_some() != cx.action.is_reset() {
            return Ok(Identity::Precomputed(0));
        }
        Ok(Identity::bytes(masked_ip(cx, self.mask)?))
    }
}

/// Like [`IpExemptUserKey`], but only privileged users are exempt.
#[derive(Debug, Clone, Copy)]
pub struct IpExemptPrivilegedKey {
    mask: NetMask,
}

impl IpExemptPrivilegedKey {
    pub fn new(mask: NetMask) -> Self {
        Self { mask }
    }
}

impl Default for IpExemptPrivilegedKey {
    fn default() -> Self {
        Self { mask: NetMask::host() }
    }
}

impl KeyStrategy for IpExemptPrivilegedKey {
    fn resolve(&self, cx: &ResolveContext<'_>) -> Result<Identity, RatelimitError> {
        if cx.request.user_is_privileged() != cx.action.is_reset() {
            return Ok(Identity::Precomputed(0));
        }
        Ok(Identity::bytes(masked_ip(cx, self.mask)?))
    }
}

/// Concatenates configured request facets into one identity.
///
/// Facet values are appended in a fixed order (network, user, sorted session
/// names, sorted headers, sorted query/form names) so equivalent
/// configurations derive equal identities. Absent headers and session values
/// are skipped; absent query/form parameters contribute an empty string.
#[derive(Debug, Clone, Default)]
pub struct FieldsKey {
    ip: Option<NetMask>,
    user: bool,
    session: Vec<Option<String>>,
    headers: Vec<String>,
    query: Vec<String>,
    form: Vec<String>,
}

impl FieldsKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip(mut self, mask: NetMask) -> Self {
        self.ip = Some(mask);
        self
    }

    pub fn user(mut self) -> Self {
        self.user = true;
        self
    }

    /// The session id itself.
    pub fn session(mut self) -> Self {
        self.session.push(None);
        self
    }

    pub fn session_value(mut self, name: impl Into<String>) -> Self {
        self.session.push(Some(name.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>) -> Self {
        self.headers.push(name.into());
        self
    }

    pub fn query_param(mut self, name: impl Into<String>) -> Self {
        self.query.push(name.into());
        self
    }

    pub fn form_param(mut self, name: impl Into<String>) -> Self {
        self.form.push(name.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.ip.is_none()
            && !self.user
            && self.session.is_empty()
            && self.headers.is_empty()
            && self.query.is_empty()
            && self.form.is_empty()
    }
}

impl KeyStrategy for FieldsKey {
    fn resolve(&self, cx: &ResolveContext<'_>) -> Result<Identity, RatelimitError> {
        let mut parts = String::new();
        if let Some(mask) = self.ip {
            parts.push_str(&masked_ip(cx, mask)?);
        }
        if self.user {
            if let Some(user) = cx.request.user_id() {
                parts.push_str(user);
            }
        }
        let mut session = self.session.clone();
        session.sort();
        session.dedup();
        for name in &session {
            match name {
                None => {
                    if let Some(id) = cx.request.session_id() {
                        parts.push_str(id);
                    }
                }
                Some(name) => {
                    if let Some(value) = cx.request.session_value(name) {
                        parts.push_str(&value);
                    }
                }
            }
        }
        let mut headers = self.headers.clone();
        headers.sort();
        headers.dedup();
        for name in &headers {
            if let Some(value) = cx.request.header(name) {
                parts.push_str(&value);
            }
        }
        let mut args: Vec<&String> = self.query.iter().chain(self.form.iter()).collect();
        args.sort();
        args.dedup();
        for name in args {
            if self.form.contains(name) {
                parts.push_str(&cx.request.form_param(name).unwrap_or_default());
            }
            if self.query.contains(name) {
                parts.push_str(&cx.request.query_param(name).unwrap_or_default());
            }
        }
        Ok(Identity::bytes(parts))
    }
}

fn parse_strategy(spec: &str) -> Result<Arc<dyn KeyStrategy>, RatelimitError> {
    let (head, arg) = match spec.split_once(':') {
        Some((head, arg)) => (head, Some(arg)),
        None => (spec, None),
    };
    // Dedicated combinators claim the whole spec.
    if !spec.contains(',') {
        match head.to_ascii_lowercase().as_str() {
            "static" => {
                return Ok(Arc::new(match arg {
                    Some(value) => StaticKey::new(value),
                    None => StaticKey::default(),
                }))
            }
            "user_or_ip" => {
                return Ok(Arc::new(UserOrIpKey::new(NetMask::parse(arg.unwrap_or(""))?)))
            }
            "user_and_ip" => {
                return Ok(Arc::new(
                    FieldsKey::new().ip(NetMask::parse(arg.unwrap_or(""))?).user(),
                ))
            }
            "ip_exempt_user" => {
                return Ok(Arc::new(IpExemptUserKey::new(NetMask::parse(arg.unwrap_or(""))?)))
            }
            "ip_exempt_privileged" => {
                return Ok(Arc::new(IpExemptPrivilegedKey::new(NetMask::parse(
                    arg.unwrap_or(""),
                )?)))
            }
            _ => {}
        }
    }
    let mut fields = FieldsKey::new();
    for facet in spec.split(',') {
        let facet = facet.trim();
        let (name, value) = match facet.split_once(':') {
            Some((name, value)) => (name, Some(value)),
            None => (facet, None),
        };
        match (name.to_ascii_lowercase().as_str(), value) {
            ("ip", mask) => fields = fields.ip(NetMask::parse(mask.unwrap_or(""))?),
            ("user", None) => fields = fields.user(),
            ("session", None) => fields = fields.session(),
            ("session", Some(name)) => fields = fields.session_value(name),
            ("header", Some(name)) => fields = fields.header(name),
            ("get", Some(name)) => fields = fields.query_param(name),
            ("post", Some(name)) => fields = fields.form_param(name),
            _ => {
                return Err(RatelimitError::Misconfigured(format!(
                    "unknown key facet: {facet:?}"
                )))
            }
        }
    }
    if fields.is_empty() {
        return Err(RatelimitError::Misconfigured(format!("empty key spec: {spec:?}")));
    }
    Ok(Arc::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SimpleRequest;

    fn resolve(key: &Key, request: &SimpleRequest, action: Action) -> Identity {
        let Key::Strategy(strategy) = key else { panic!("expected strategy") };
        let cx = ResolveContext {
            request,
            group: "g",
            action,
            trusted_proxies: &TrustedProxies::None,
        };
        strategy.resolve(&cx).unwrap()
    }

    #[test]
    fn static_key_ignores_request() {
        let key = Key::parse("static:tenant-1").unwrap();
        let req = SimpleRequest::new("GET");
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes("tenant-1"));
        let key = Key::parse("static").unwrap();
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes("static"));
    }

    #[test]
    fn user_resolves_to_empty_when_anonymous() {
        let key = Key::parse("user").unwrap();
        let req = SimpleRequest::new("GET");
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes(""));
        let req = SimpleRequest::new("GET").with_user("17");
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes("17"));
    }

    #[test]
    fn ip_uses_masked_network() {
        let key = Key::parse("ip:16/64").unwrap();
        let a = SimpleRequest::new("GET").with_peer_addr("1.2.3.4");
        let b = SimpleRequest::new("GET").with_peer_addr("1.2.200.200");
        let c = SimpleRequest::new("GET").with_peer_addr("1.3.0.1");
        assert_eq!(resolve(&key, &a, Action::Peek), resolve(&key, &b, Action::Peek));
        assert_ne!(resolve(&key, &a, Action::Peek), resolve(&key, &c, Action::Peek));
    }

    #[test]
    fn user_or_ip_prefers_user() {
        let key = Key::parse("user_or_ip").unwrap();
        let anon = SimpleRequest::new("GET").with_peer_addr("1.2.3.4");
        let user = SimpleRequest::new("GET").with_peer_addr("1.2.3.4").with_user("17");
        assert_eq!(resolve(&key, &user, Action::Peek), Identity::bytes("17"));
        assert!(matches!(resolve(&key, &anon, Action::Peek), Identity::Bytes(b) if !b.is_empty()));
    }

    #[test]
    fn exemption_polarity_flips_on_reset() {
        let key = Key::parse("ip_exempt_user").unwrap();
        let anon = SimpleRequest::new("GET").with_peer_addr("1.2.3.4");
        let user = SimpleRequest::new("GET").with_peer_addr("1.2.3.4").with_user("17");

        // Counting: users are exempt, anonymous callers are counted by net.
        assert_eq!(resolve(&key, &user, Action::Increase), Identity::Precomputed(0));
        assert!(matches!(resolve(&key, &anon, Action::Increase), Identity::Bytes(_)));

        // Resetting: users hit the counter key, anonymous callers are inert.
        assert!(matches!(resolve(&key, &user, Action::Reset), Identity::Bytes(_)));
        assert_eq!(resolve(&key, &anon, Action::ResetEpoch), Identity::Precomputed(0));
    }

    #[test]
    fn privileged_exemption_checks_privilege_not_identity() {
        let key = Key::parse("ip_exempt_privileged").unwrap();
        let plain = SimpleRequest::new("GET").with_peer_addr("1.2.3.4").with_user("17");
        let admin = SimpleRequest::new("GET").with_peer_addr("1.2.3.4").with_privileged_user("1");
        assert!(matches!(resolve(&key, &plain, Action::Increase), Identity::Bytes(_)));
        assert_eq!(resolve(&key, &admin, Action::Increase), Identity::Precomputed(0));
    }

    #[test]
    fn composite_concatenates_in_stable_order() {
        let key = Key::parse("user,header:x-api-key,get:token").unwrap();
        let req = SimpleRequest::new("GET")
            .with_user("u1")
            .with_header("x-api-key", "K")
            .with_query_param("token", "T");
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes("u1KT"));

        // Missing query parameters contribute an empty string, missing
        // headers nothing at all.
        let bare = SimpleRequest::new("GET").with_user("u1");
        assert_eq!(resolve(&key, &bare, Action::Peek), Identity::bytes("u1"));
    }

    #[test]
    fn session_facets() {
        let key = Key::parse("session").unwrap();
        let req = SimpleRequest::new("GET").with_session_id("s-9");
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes("s-9"));

        let key = Key::parse("session:csrf").unwrap();
        let req = SimpleRequest::new("GET").with_session_value("csrf", "z");
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes("z"));
    }

    #[test]
    fn unknown_specs_are_rejected() {
        assert!(Key::parse("banana").is_err());
        assert!(Key::parse("header").is_err());
        assert!(Key::parse("").is_err());
        assert!(Key::parse("ip:999").is_err());
    }

    #[test]
    fn closures_are_strategies() {
        let key = Key::from_fn(|cx: &ResolveContext<'_>| {
            Ok(Identity::bytes(cx.group.to_uppercase()))
        });
        let req = SimpleRequest::new("GET");
        assert_eq!(resolve(&key, &req, Action::Peek), Identity::bytes("G"));
    }
}
