//! Browser-facing response hardening.
//!
//! Davs accept cross-origin requests from the gateway's own pages, and
//! gateway pages (plus apps that ask for it) carry strict transport and
//! content security headers.

use axum::{
    Router,
    http::{
        HeaderName, HeaderValue, Method,
        header::{
            ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_LENGTH, CONTENT_SECURITY_POLICY,
            CONTENT_TYPE, REFERRER_POLICY, STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS,
            X_XSS_PROTECTION,
        },
        request::Parts,
    },
    response::Response,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

/// Methods a dav answers cross-origin.
const DAV_METHODS: &[&str] = &[
    "POST", "GET", "OPTIONS", "PUT", "DELETE", "PROPFIND", "MKCOL", "MOVE", "COPY",
];

/// CORS for davs: the gateway host, its parent domain and its subdomains
/// may call in with credentials.
#[must_use]
pub fn dav_cors(hostname: &str, port: u16) -> CorsLayer {
    let hostname = hostname.to_string();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _: &Parts| {
                origin
                    .to_str()
                    .is_ok_and(|origin| origin_allowed(origin, &hostname, port))
            },
        ))
        .allow_methods(
            DAV_METHODS
                .iter()
                .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
                .collect::<Vec<_>>(),
        )
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            CONTENT_LENGTH,
            ACCEPT_ENCODING,
            HeaderName::from_static("xsrf-token"),
            AUTHORIZATION,
            HeaderName::from_static("depth"),
            HeaderName::from_static("destination"),
            HeaderName::from_static("x-oc-mtime"),
        ])
        .allow_credentials(true)
}

/// Whether `origin` is `https://` plus the gateway host, its parent
/// domain or one of its subdomains. The port is part of the origin unless
/// it is 80 or 443.
pub fn origin_allowed(origin: &str, hostname: &str, port: u16) -> bool {
    let port_suffix = if port == 80 || port == 443 {
        String::new()
    } else {
        format!(":{port}")
    };
    let Some(host) = origin
        .strip_prefix("https://")
        .and_then(|rest| rest.strip_suffix(port_suffix.as_str()))
    else {
        return false;
    };
    if host.contains(':') {
        return false;
    }

    let parent = hostname.split_once('.').map_or(hostname, |(_, parent)| parent);
    host == hostname
        || host == parent
        || host
            .strip_suffix(hostname)
            .and_then(|lead| lead.strip_suffix('.'))
            .is_some_and(|label| !label.is_empty())
}

/// Strict transport, content security and related headers.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    source: String,
    allow_eval_inline_script: bool,
}

impl SecurityHeaders {
    /// Headers whose content security policy admits `source`.
    pub fn new(source: impl Into<String>, allow_eval_inline_script: bool) -> Self {
        Self {
            source: source.into(),
            allow_eval_inline_script,
        }
    }

    /// For the gateway's own pages.
    #[must_use]
    pub fn for_gateway(hostname: &str) -> Self {
        Self::new(format!("*.{hostname}:*"), false)
    }

    /// For davs.
    #[must_use]
    pub fn for_davs(hostname: &str) -> Self {
        Self::new(format!("*.{hostname}:* {hostname}:*"), false)
    }

    /// For apps that opt in; their scripts may be inline.
    #[must_use]
    pub fn for_apps(hostname: &str) -> Self {
        Self::new(format!("{hostname}:* *.{hostname}:*"), true)
    }

    /// Add the headers to every response of `router`.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let policy = self.clone();
        router
            .layer(SetResponseHeaderLayer::overriding(
                CONTENT_SECURITY_POLICY,
                move |response: &Response| {
                    policy.content_security_policy(response.headers().get(CONTENT_SECURITY_POLICY))
                },
            ))
            .layer(SetResponseHeaderLayer::overriding(
                STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static("max-age=63072000"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                X_XSS_PROTECTION,
                HeaderValue::from_static("1; mode=block"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                REFERRER_POLICY,
                HeaderValue::from_static("strict-origin"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
    }

    /// A policy set by the handler keeps its rules and gains `source` as a
    /// frame ancestor; otherwise a default policy is forged.
    fn content_security_policy(&self, existing: Option<&HeaderValue>) -> Option<HeaderValue> {
        let source = &self.source;
        let policy = match existing.and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty()) {
            Some(policy) if policy.contains("frame-ancestors") => {
                policy.replacen("frame-ancestors", &format!("frame-ancestors {source}"), 1)
            }
            Some(policy) => format!("{policy}; frame-ancestors {source}"),
            None => {
                let inline = if self.allow_eval_inline_script {
                    "'unsafe-inline' 'unsafe-eval'"
                } else {
                    ""
                };
                format!(
                    "default-src {source} 'self'; img-src {source} 'self' blob: data: ; \
                     script-src 'self' {source} {inline}; style-src 'self' 'unsafe-inline'; \
                     frame-src {source}; frame-ancestors {source}"
                )
            }
        };
        HeaderValue::from_str(&policy).ok()
    }
}
