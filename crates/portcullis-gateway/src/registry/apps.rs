//! Applications: reverse-proxied services or static sites.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, HOST, LOCATION},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use url::Url;

use super::{BackendEntry, HandlerFactory, RegistryError};
use crate::host::request_authority;
use crate::security::SecurityHeaders;

/// Headers that only concern a single connection.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An application definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEntry {
    /// Identifier.
    #[serde(default)]
    pub id: i64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Icon name for the portal.
    #[serde(default)]
    pub icon: String,
    /// Tile colour for the portal.
    #[serde(default)]
    pub color: String,
    /// Reverse proxy to `forward_to` instead of serving files.
    #[serde(default)]
    pub is_proxy: bool,
    /// Host name or `*.domain` pattern.
    pub host: String,
    /// Proxy target, `http://` assumed when no scheme is given.
    #[serde(default)]
    pub forward_to: String,
    /// Directory served when not a proxy.
    #[serde(default)]
    pub serve: String,
    /// Whether requests must be authorized.
    #[serde(default)]
    pub secured: bool,
    /// Basic credentials injected into proxied requests.
    #[serde(default)]
    pub login: String,
    /// See `login`.
    #[serde(default)]
    pub password: String,
    /// Path the portal opens.
    #[serde(default)]
    pub open_path: String,
    /// Roles admitted when secured.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Add strict transport and content security headers to responses.
    #[serde(default, rename = "securityheaders")]
    pub security_headers: bool,
}

impl AppEntry {
    /// Copy with the upstream credentials blanked.
    #[must_use]
    pub fn without_credentials(&self) -> Self {
        Self {
            login: String::new(),
            password: String::new(),
            ..self.clone()
        }
    }
}

impl BackendEntry for AppEntry {
    const KIND: &'static str = "app";
    const REQUIRES_XSRF: bool = false;

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn secured(&self) -> bool {
        self.secured
    }

    fn roles(&self) -> &[String] {
        &self.roles
    }
}

/// Builds proxy or file-server handlers for applications.
#[derive(Debug, Clone)]
pub struct AppHandlerFactory {
    client: reqwest::Client,
    hostname: String,
    public_port: u16,
}

impl AppHandlerFactory {
    /// Factory for apps of the gateway at `hostname`, whose rewritten
    /// redirects advertise `public_port`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(hostname: impl Into<String>, public_port: u16) -> Result<Self, RegistryError> {
        // Upstreams commonly sit behind self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?;
        Ok(Self {
            client,
            hostname: hostname.into(),
            public_port,
        })
    }
}

impl HandlerFactory<AppEntry> for AppHandlerFactory {
    fn build(&self, entry: &AppEntry) -> Result<Router, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidEntry {
            kind: AppEntry::KIND,
            id: entry.id,
            reason,
        };

        if entry.is_proxy {
            let target = parse_target(&entry.forward_to).map_err(invalid)?;
            let credentials = (!entry.login.is_empty() && !entry.password.is_empty())
                .then(|| (entry.login.clone(), entry.password.clone()));
            let proxy = Arc::new(Proxy {
                client: self.client.clone(),
                target,
                credentials,
                public_host: entry.host.trim_start_matches("*.").to_string(),
                public_port: self.public_port,
            });
            return Ok(Router::new().fallback(forward).with_state(proxy));
        }

        if !entry.serve.is_empty() {
            return Ok(Router::new().fallback_service(ServeDir::new(&entry.serve)));
        }

        Err(invalid("neither a proxy nor a directory".to_string()))
    }

    fn decorate(&self, entry: &AppEntry, handler: Router) -> Router {
        if entry.security_headers {
            SecurityHeaders::for_apps(&self.hostname).apply(handler)
        } else {
            handler
        }
    }
}

fn parse_target(forward_to: &str) -> Result<Url, String> {
    if forward_to.trim().is_empty() {
        return Err("forwardTo is empty".to_string());
    }
    let candidate = if forward_to.contains("://") {
        forward_to.to_string()
    } else {
        format!("http://{forward_to}")
    };
    let url = Url::parse(&candidate).map_err(|e| format!("forwardTo: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", url.scheme()));
    }
    Ok(url)
}

struct Proxy {
    client: reqwest::Client,
    target: Url,
    credentials: Option<(String, String)>,
    public_host: String,
    public_port: u16,
}

impl Proxy {
    fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.target.clone();
        let base = self.target.path().trim_end_matches('/');
        url.set_path(&format!("{base}{path}"));
        url.set_query(query);
        url
    }

    /// Point absolute redirects to the target back at the public host.
    fn rewrite_location(&self, location: &str) -> Option<String> {
        let target_host = self.target.host_str()?;
        let location = Url::parse(location).ok()?;
        if !location.host_str()?.contains(target_host) {
            return None;
        }
        let query = location
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        Some(format!(
            "https://{}:{}{}{query}",
            self.public_host,
            self.public_port,
            location.path()
        ))
    }
}

async fn forward(State(proxy): State<Arc<Proxy>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let authority = request_authority(&parts.headers, &parts.uri);
    let url = proxy.upstream_url(parts.uri.path(), parts.uri.query());

    // Targets without an explicit port are external sites that expect their
    // own host name; internal services get the public one.
    let mut headers = strip_hop_by_hop(&parts.headers);
    headers.remove(HOST);
    if proxy.target.port().is_some() {
        if let Ok(value) = HeaderValue::from_str(&authority) {
            headers.insert(HOST, value);
        }
    }
    if proxy.credentials.is_some() {
        headers.remove(AUTHORIZATION);
    }

    let mut upstream = proxy
        .client
        .request(parts.method.clone(), url.clone())
        .headers(headers);
    if let Some((login, password)) = &proxy.credentials {
        upstream = upstream.basic_auth(login, Some(password));
    }
    let upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let response = match upstream.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(%url, error = %e, "upstream request failed");
            return (StatusCode::BAD_GATEWAY, "bad gateway").into_response();
        }
    };

    let status = response.status();
    let mut headers = strip_hop_by_hop(response.headers());
    let rewritten = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|location| proxy.rewrite_location(location))
        .and_then(|location| HeaderValue::from_str(&location).ok());
    if let Some(location) = rewritten {
        headers.insert(LOCATION, location);
    }

    let mut reply = Response::new(Body::from_stream(response.bytes_stream()));
    *reply.status_mut() = status;
    *reply.headers_mut() = headers;
    reply
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    out
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("target", &self.target.as_str())
            .field("credentials", &self.credentials.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}
