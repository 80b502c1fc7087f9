//! Client address extraction and canonicalization.
//!
//! Addresses from both families are mapped into one comparison domain:
//! IPv4 becomes an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) before a
//! prefix mask is applied, so `ip`-based strategies group v4 and v6
//! clients with the same arithmetic.

use std::net::IpAddr;

use ipnet::Ipv6Net;

use crate::error::RatelimitError;
use crate::request::RequestContext;

/// Which transport peers are allowed to speak for clients via forwarding
/// headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TrustedProxies {
    /// Trust nobody: the peer address is always the client.
    #[default]
    None,
    /// Trust every peer.
    All,
    /// Trust the listed peer addresses.
    List(Vec<String>),
}

impl TrustedProxies {
    pub fn list<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(addrs.into_iter().map(Into::into).collect())
    }

    fn contains(&self, peer: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(addrs) => addrs.iter().any(|a| a == peer),
        }
    }
}

/// First `for=` element of a `Forwarded` header.
fn parse_forwarded(header: &str) -> Option<String> {
    let lower = header.to_ascii_lowercase();
    let start = lower.find("for=")? + 4;
    let rest = &header[start..];
    let rest = rest.strip_prefix('"').unwrap_or(rest);
    let end = rest
        .find(|c| matches!(c, '"' | ';' | ',' | ' '))
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then(|| value.to_string())
}

/// First element of an `X-Forwarded-For` header.
fn parse_forwarded_for(header: &str) -> Option<String> {
    let first = header.split(',').next()?.trim().trim_matches('"');
    (!first.is_empty()).then(|| first.to_string())
}

/// Strip a trailing port (and brackets) from either address family.
fn strip_port(addr: &str) -> &str {
    if addr.contains('.') && addr.matches(':').count() <= 1 {
        addr.split(':').next().unwrap_or(addr)
    } else {
        let inner = addr.trim_start_matches('[');
        match inner.split_once(']') {
            Some((host, _)) => host,
            None => inner,
        }
    }
}

/// Resolve the client address for a request.
///
/// Starts from the transport peer; when the peer is a trusted proxy the
/// `Forwarded` header wins over `X-Forwarded-For`, which wins over the
/// peer itself.
pub fn client_ip(
    request: &dyn RequestContext,
    trusted: &TrustedProxies,
) -> Result<IpAddr, RatelimitError> {
    let peer = request.peer_addr().unwrap_or("").to_string();
    let mut candidate = if peer.is_empty() { "unix".to_string() } else { peer };
    if trusted.contains(&candidate) {
        if let Some(forwarded) = request.forwarded().and_then(parse_forwarded) {
            candidate = forwarded;
        } else if let Some(forwarded) = request.forwarded_for().and_then(parse_forwarded_for) {
            candidate = forwarded;
        }
    }
    if candidate == "unix" || candidate == "invalid" {
        return Err(RatelimitError::MissingIp);
    }
    strip_port(&candidate)
        .parse()
        .map_err(|_| RatelimitError::MissingIp)
}

/// Map an address into IPv6 space. Returns the /128 network and whether the
/// original was IPv4.
pub fn canonical_net(ip: IpAddr) -> (Ipv6Net, bool) {
    let (addr, is_v4) = match ip {
        IpAddr::V4(v4) => (v4.to_ipv6_mapped(), true),
        IpAddr::V6(v6) => (v6, false),
    };
    // /128 is always a valid prefix.
    (Ipv6Net::new(addr, 128).expect("/128 prefix"), is_v4)
}

/// Prefix lengths grouping addresses into networks, expressed in the mapped
/// IPv6 domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetMask {
    mapped_v4_prefix: u8,
    v6_prefix: u8,
}

impl NetMask {
    /// Full-host mask: every address is its own group.
    pub fn host() -> Self {
        Self { mapped_v4_prefix: 128, v6_prefix: 128 }
    }

    /// One prefix applied to both families in the mapped domain (0..=128).
    pub fn single(prefix: u8) -> Result<Self, RatelimitError> {
        if prefix > 128 {
            return Err(RatelimitError::Misconfigured(format!(
                "ipv6 prefix out of range: {prefix}"
            )));
        }
        Ok(Self { mapped_v4_prefix: prefix, v6_prefix: prefix })
    }

    /// Separate per-family prefixes: an IPv4 prefix (0..=32, applied at
    /// `96 + prefix` on the mapped address) and an IPv6 prefix (0..=128).
    pub fn split(v4_prefix: u8, v6_prefix: u8) -> Result<Self, RatelimitError> {
        if v4_prefix > 32 {
            return Err(RatelimitError::Misconfigured(format!(
                "ipv4 prefix out of range: {v4_prefix}"
            )));
        }
        if v6_prefix > 128 {
            return Err(RatelimitError::Misconfigured(format!(
                "ipv6 prefix out of range: {v6_prefix}"
            )));
        }
        Ok(Self { mapped_v4_prefix: 96 + v4_prefix, v6_prefix })
    }

    /// Parse `"64"` or `"16/64"`; an empty spec is the host mask.
    pub fn parse(spec: &str) -> Result<Self, RatelimitError> {
        if spec.is_empty() {
            return Ok(Self::host());
        }
        let bad = || RatelimitError::Misconfigured(format!("invalid netmask: {spec:?}"));
        match spec.split_once('/') {
            None => Self::single(spec.parse().map_err(|_| bad())?),
            Some((v4, v6)) => Self::split(
                v4.parse().map_err(|_| bad())?,
                v6.parse().map_err(|_| bad())?,
            ),
        }
    }

    /// Canonicalize and mask an address into its group network.
    pub fn apply(&self, ip: IpAddr) -> Ipv6Net {
        let (net, is_v4) = canonical_net(ip);
        let prefix = if is_v4 { self.mapped_v4_prefix } else { self.v6_prefix };
        // Prefixes are validated at construction.
        Ipv6Net::new(net.addr(), prefix).expect("validated prefix").trunc()
    }
}
