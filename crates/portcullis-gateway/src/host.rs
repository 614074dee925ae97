//! Host name helpers shared by routing and authorization.

use axum::http::{HeaderMap, Uri, header::HOST};

/// `host[:port]` the request was addressed to.
///
/// The `Host` header wins; HTTP/2 requests fall back to the URI authority.
#[must_use]
pub fn request_authority(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(ToString::to_string))
        .unwrap_or_default()
}

/// Split `host[:port]` into its parts. Bracketed IPv6 literals keep
/// their brackets.
#[must_use]
pub fn split_port(authority: &str) -> (&str, Option<&str>) {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => {
                let (host, rest) = authority.split_at(end + 1);
                (host, rest.strip_prefix(':').filter(|p| !p.is_empty()))
            }
            None => (authority, None),
        };
    }
    match authority.split_once(':') {
        Some((host, port)) => (host, Some(port).filter(|p| !p.is_empty())),
        None => (authority, None),
    }
}

/// Host without its port.
#[must_use]
pub fn strip_port(authority: &str) -> &str {
    split_port(authority).0
}

/// Whether `host` matches `pattern`: exact equality, or for `*.domain`
/// the domain itself or any name ending in `.domain`.
#[must_use]
pub fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(domain) => {
            host == domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        }
        None => pattern == host,
    }
}
