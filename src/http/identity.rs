//! Identifier and endpoint key resolution.
//!
//! An identifier names who is calling (`user:<id>` or `ip:<addr>`); an
//! endpoint key names what they are calling (`"<METHOD> <path-template>"`).
//! Together they select a counter.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Method, Request};
use tracing::{debug, warn};
use uuid::Uuid;

/// Placeholder substituted for id-like path segments.
const ID_PLACEHOLDER: &str = ":id";

/// Authenticated caller, inserted as a request extension by an upstream
/// auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Proxy addresses whose forwarding headers are believed.
///
/// Empty by default, in which case `X-Forwarded-For` and `X-Real-IP` are
/// ignored and callers are identified by their connection peer.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies(Arc<HashSet<IpAddr>>);

impl TrustedProxies {
    pub fn new(proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        Self(Arc::new(proxies.into_iter().collect()))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }
}

/// Resolve the rate-limit identifier for `request`.
pub fn resolve_identifier<B>(request: &Request<B>, trusted: &TrustedProxies) -> String {
    if let Some(Principal(id)) = request.extensions().get::<Principal>() {
        return format!("user:{}", id);
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match client_ip(request.headers(), peer, trusted) {
        Some(ip) => format!("ip:{}", ip),
        None => {
            warn!("Could not determine client IP address");
            "ip:unknown".to_string()
        }
    }
}

/// Client address for a connection from `peer`.
///
/// Forwarding headers are only read when `peer` is a trusted proxy. The
/// client is then the rightmost `X-Forwarded-For` hop that is not itself a
/// trusted proxy, falling back to `X-Real-IP` and finally the peer.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted: &TrustedProxies,
) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.contains(&peer) {
        return Some(peer);
    }

    if let Some(ip) = forwarded_client(headers, trusted) {
        debug!(ip = %ip, proxy = %peer, "Extracted IP from X-Forwarded-For");
        return Some(ip);
    }

    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        debug!(ip = %ip, proxy = %peer, "Extracted IP from X-Real-IP");
        return Some(ip);
    }

    Some(peer)
}

fn forwarded_client(headers: &HeaderMap, trusted: &TrustedProxies) -> Option<IpAddr> {
    let hops: Vec<IpAddr> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .collect();

    // Entries left of the first untrusted hop (from the right) are client
    // supplied.
    hops.iter()
        .rev()
        .find(|ip| !trusted.contains(ip))
        .or_else(|| hops.first())
        .copied()
}

/// Build the endpoint key for a method and path.
pub fn endpoint_key(method: &Method, path: &str) -> String {
    format!("{} {}", method, normalize_path(path))
}

/// Replace numeric and UUID segments with `:id` and drop a trailing slash.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| if is_id_segment(s) { ID_PLACEHOLDER } else { s })
        .collect();

    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

fn is_id_segment(segment: &str) -> bool {
    segment.bytes().all(|b| b.is_ascii_digit()) || Uuid::parse_str(segment).is_ok()
}
