//! Session token management.
//!
//! A token is `{expiresAt, iat, data}` serialized as JSON, compressed,
//! encrypted and encoded with URL-safe base64 so it can travel in a query
//! string, a cookie or an `Authorization` header unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use portcullis_core::codec::{self, CodecError, SessionKey};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Query parameter that carries a token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Token failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// No token in any supported location.
    #[error("no token found")]
    NotFound,

    /// Token was not produced with the current key or was altered.
    #[error("token integrity check failed")]
    Integrity,

    /// Token lifetime is over.
    #[error("token expired")]
    Expired,

    /// Token decrypted but its content is malformed.
    #[error("invalid token format: {0}")]
    Format(String),

    /// Token could not be produced.
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

impl TokenError {
    /// Reason safe to show to clients.
    ///
    /// Integrity and format failures read the same.
    #[must_use]
    pub const fn public_reason(&self) -> &'static str {
        match self {
            Self::NotFound => "no token found",
            Self::Integrity | Self::Format(_) => "invalid token",
            Self::Expired => "token expired",
            Self::Encoding(_) => "token encoding failed",
        }
    }
}

impl From<CodecError> for TokenError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Integrity => Self::Integrity,
            CodecError::Format(msg) => Self::Format(msg),
            other => Self::Encoding(other.to_string()),
        }
    }
}

/// Source of the current time, in seconds since the epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time.
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock that only moves when told to. Useful in tests.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    /// Start at `now`.
    #[must_use]
    pub const fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    /// Jump to `now`.
    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    /// Move forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a token was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `?token=` query parameter.
    Query,
    /// Named cookie.
    Cookie,
    /// `Authorization: Bearer`.
    Bearer,
    /// Password part of `Authorization: Basic`.
    Basic,
}

impl TokenSource {
    /// Whether XSRF protection applies to a token from this source.
    ///
    /// Only cookies are sent automatically by browsers.
    #[must_use]
    pub const fn xsrf_applies(self, requested: bool) -> bool {
        matches!(self, Self::Cookie) && requested
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "expiresAt")]
    expires_at: i64,
    #[serde(rename = "iat")]
    issued_at: i64,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Creates, stores, extracts and validates tokens under one key.
pub struct TokenManager {
    key: SessionKey,
    debug: bool,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    /// Create a manager using the wall clock.
    ///
    /// With `debug` set, cookies are not marked `Secure`.
    #[must_use]
    pub fn new(key: SessionKey, debug: bool) -> Self {
        Self {
            key,
            debug,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time according to the manager's clock.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Whether cookies are issued without `Secure`.
    #[must_use]
    pub const fn debug(&self) -> bool {
        self.debug
    }

    /// Seal `payload` into a token valid until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Encoding` if serialization or encryption fails.
    pub fn create_token<T: Serialize>(
        &self,
        payload: &T,
        expires_at: i64,
    ) -> Result<String, TokenError> {
        let data =
            serde_json::to_vec(payload).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let envelope = Envelope {
            expires_at,
            issued_at: self.now(),
            data,
        };
        let plain =
            serde_json::to_vec(&envelope).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let sealed = codec::seal(&plain, &self.key)?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Build a cookie holding a token for `payload` that lives for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Encoding` if the token cannot be created.
    pub fn store_in_cookie<T: Serialize>(
        &self,
        payload: &T,
        domain: &str,
        cookie_name: &str,
        ttl: Duration,
    ) -> Result<Cookie<'static>, TokenError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = self.now().saturating_add(ttl_secs);
        let token = self.create_token(payload, expires_at)?;

        let mut builder = Cookie::build((cookie_name.to_string(), token))
            .domain(domain.to_string())
            .path("/")
            .http_only(true)
            .secure(!self.debug)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(ttl_secs));
        if let Ok(at) = time::OffsetDateTime::from_unix_timestamp(expires_at) {
            builder = builder.expires(at);
        }
        Ok(builder.build())
    }

    /// Cookie that makes the browser drop `cookie_name`.
    #[must_use]
    pub fn removal_cookie(&self, cookie_name: &str, domain: &str) -> Cookie<'static> {
        let mut cookie = Cookie::build((cookie_name.to_string(), String::new()))
            .domain(domain.to_string())
            .path("/")
            .http_only(true)
            .secure(!self.debug)
            .same_site(SameSite::Lax)
            .build();
        cookie.make_removal();
        cookie
    }

    /// Find and open a token on the request.
    ///
    /// Returns whether XSRF checking applies to the token that was found,
    /// which is `check_xsrf` for cookies and `false` otherwise.
    ///
    /// # Errors
    ///
    /// `TokenError::NotFound` when no location holds a token, otherwise
    /// the error from [`Self::unstore`].
    pub fn extract<T: DeserializeOwned>(
        &self,
        parts: &Parts,
        cookie_name: &str,
        check_xsrf: bool,
    ) -> Result<(bool, T), TokenError> {
        let (source, token) = find_token(parts, cookie_name).ok_or(TokenError::NotFound)?;
        let payload = self.unstore(&token)?;
        Ok((source.xsrf_applies(check_xsrf), payload))
    }

    /// Open a token and decode its payload.
    ///
    /// # Errors
    ///
    /// `Integrity` for tokens not sealed under this key, `Format` for
    /// malformed content, `Expired` once `expiresAt` is reached.
    pub fn unstore<T: DeserializeOwned>(&self, token: &str) -> Result<T, TokenError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Integrity)?;
        let plain = codec::open(&sealed, &self.key)?;
        let envelope: Envelope =
            serde_json::from_slice(&plain).map_err(|e| TokenError::Format(e.to_string()))?;

        if self.now() >= envelope.expires_at {
            return Err(TokenError::Expired);
        }

        serde_json::from_slice(&envelope.data).map_err(|e| TokenError::Format(e.to_string()))
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

/// Locate a token: query parameter, cookie, bearer header, then the
/// password of a basic header.
#[must_use]
pub fn find_token(parts: &Parts, cookie_name: &str) -> Option<(TokenSource, String)> {
    if let Some(query) = parts.uri.query() {
        let from_query = url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, value)| name == TOKEN_QUERY_PARAM && !value.is_empty())
            .map(|(_, value)| value.into_owned());
        if let Some(token) = from_query {
            return Some((TokenSource::Query, token));
        }
    }

    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(cookie) = jar.get(cookie_name) {
        if !cookie.value().is_empty() {
            return Some((TokenSource::Cookie, cookie.value().to_string()));
        }
    }

    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    if let Some(token) = extract_bearer(header) {
        return Some((TokenSource::Bearer, token.to_string()));
    }
    basic_credentials(header)
        .map(|(_, password)| password)
        .filter(|password| !password.is_empty())
        .map(|password| (TokenSource::Basic, password))
}

/// Token from a `Bearer` authorization value.
#[must_use]
pub fn extract_bearer(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Login and password from a `Basic` authorization value.
#[must_use]
pub fn basic_credentials(header: &str) -> Option<(String, String)> {
    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (login, password) = decoded.split_once(':')?;
    Some((login.to_string(), password.to_string()))
}

/// Random URL-safe value with `bytes` bytes of entropy.
#[must_use]
pub fn random_value(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
