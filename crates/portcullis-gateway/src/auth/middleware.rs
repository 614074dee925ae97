//! Authorization middleware for axum.
//!
//! Every protected router is wrapped by an [`Authorizer`]. On each
//! request the guard opens the session token, applies the access policy
//! and hands the principal to the handler through request extensions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Request, State},
    http::{
        HeaderValue, Method, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT, WWW_AUTHENTICATE},
        request::Parts,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use portcullis_core::{SessionKey, SessionPrincipal, types::roles_allowed};
use serde::Serialize;
use subtle::ConstantTimeEq;

use super::AuthError;
use super::config::{AuthConfig, REDIRECT_COOKIE, REDIRECT_COOKIE_TTL, XSRF_HEADER};
use super::tokens::{TokenError, TokenManager, basic_credentials};
use super::users::{CredentialVerifier, UserStore};
use crate::host::{request_authority, split_port};

/// User-agent fragments of WebDAV clients that cannot present tokens and
/// fall back to Basic credentials.
pub const LEGACY_CLIENT_SIGNATURES: &[&str] = &[
    "vfs",
    "Microsoft-WebDAV",
    "Konqueror",
    "LibreOffice",
    "Rei.Fs.WebDAV",
    "Documents",
];

/// Methods a read-only token may use.
const SAFE_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "PROPFIND"];

/// Who may reach a wrapped handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Accepted roles; `*` accepts any authenticated user.
    pub allowed_roles: Vec<String>,
    /// Whether cookie-borne tokens must be accompanied by the XSRF header.
    pub require_xsrf: bool,
}

impl AccessPolicy {
    /// Policy for `roles`, with or without XSRF protection.
    #[must_use]
    pub fn new<I, S>(roles: I, require_xsrf: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_roles: roles.into_iter().map(Into::into).collect(),
            require_xsrf,
        }
    }

    /// Any authenticated user.
    #[must_use]
    pub fn any_user(require_xsrf: bool) -> Self {
        Self::new([portcullis_core::types::ANY_ROLE], require_xsrf)
    }
}

/// Wraps a handler so it only runs for authorized requests.
pub trait Authorizer: Send + Sync {
    /// Guard `handler` with `policy`.
    fn wrap(&self, handler: Router, policy: AccessPolicy) -> Router;
}

/// Shared authentication state.
pub struct AuthState {
    /// Auth configuration.
    pub config: AuthConfig,
    /// Token manager.
    pub tokens: TokenManager,
    /// Local credential check.
    pub users: Arc<dyn CredentialVerifier>,
}

impl AuthState {
    /// Create a new auth state.
    #[must_use]
    pub fn new(
        config: AuthConfig,
        tokens: TokenManager,
        users: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            config,
            tokens,
            users,
        }
    }

    /// Initialize auth state from configuration, loading or generating
    /// the token key.
    #[must_use]
    pub fn initialize(config: AuthConfig) -> Self {
        let (key, origin) = SessionKey::load_or_generate(&config.key_file);
        if origin == portcullis_core::KeyOrigin::Generated {
            tracing::info!(path = %config.key_file.display(), "Generated new token key");
        }

        let tokens = TokenManager::new(key, config.debug);
        let users = Arc::new(UserStore::new(config.users_file.clone()));
        Self::new(config, tokens, users)
    }

    /// Session cookie for `principal`.
    ///
    /// # Errors
    ///
    /// Returns error if the token cannot be created.
    pub fn session_cookie(
        &self,
        principal: &SessionPrincipal,
    ) -> Result<Cookie<'static>, AuthError> {
        Ok(self.tokens.store_in_cookie(
            principal,
            &self.config.hostname,
            &self.config.cookie_name,
            self.config.session_ttl(),
        )?)
    }

    /// Apply `policy` to a request.
    ///
    /// On success the returned principal has its admin flag recomputed.
    /// On failure the ready-made response is returned.
    ///
    /// # Errors
    ///
    /// Returns the response to send instead of calling the handler.
    pub async fn check(
        &self,
        parts: &Parts,
        policy: &AccessPolicy,
    ) -> Result<SessionPrincipal, Response> {
        let extracted = self.tokens.extract::<SessionPrincipal>(
            parts,
            &self.config.cookie_name,
            policy.require_xsrf,
        );
        let (check_xsrf, mut principal) = match extracted {
            Ok(found) => found,
            Err(err) => (false, self.without_token(parts, &err).await?),
        };

        if check_xsrf {
            verify_xsrf(parts, &principal).map_err(IntoResponse::into_response)?;
        }

        if !roles_allowed(&principal.user.roles, &policy.allowed_roles) {
            return Err(AuthError::ForbiddenRole {
                roles: principal.user.roles.clone(),
                allowed: policy.allowed_roles.clone(),
            }
            .into_response());
        }

        principal.user.is_admin = principal.user.has_role(&self.config.admin_role);

        if let Some(url) = principal.url.as_deref().filter(|u| !u.is_empty()) {
            let authority = request_authority(&parts.headers, &parts.uri);
            let (host, _) = split_port(&authority);
            if !url_allowed(url, host, parts.uri.path()) {
                return Err(AuthError::ScopeMismatch(url.to_string()).into_response());
            }
        }

        if principal.readonly && !SAFE_METHODS.contains(&parts.method.as_str()) {
            return Err(AuthError::ReadOnly.into_response());
        }

        Ok(principal)
    }

    /// No usable token: legacy clients may authenticate with their
    /// password, preflights pass, everyone else is sent to the login page.
    async fn without_token(
        &self,
        parts: &Parts,
        err: &TokenError,
    ) -> Result<SessionPrincipal, Response> {
        if is_legacy_client(parts) {
            let credentials = parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(basic_credentials);
            let Some((login, password)) = credentials else {
                return Err(legacy_challenge());
            };
            // Password hashing and the account file read stay off the runtime.
            let users = self.users.clone();
            let who = login.clone();
            let verified = tokio::task::spawn_blocking(move || users.verify(&who, &password))
                .await
                .unwrap_or_else(|e| Err(AuthError::Storage(format!("credential check: {e}"))));
            return match verified {
                Ok(user) => {
                    tracing::debug!(%login, "legacy client authenticated with credentials");
                    Ok(SessionPrincipal::from(user))
                }
                Err(e) => {
                    tracing::warn!(%login, error = %e, "legacy client authentication failed");
                    Err(legacy_challenge())
                }
            };
        }

        if parts.method == Method::OPTIONS {
            return Err(StatusCode::OK.into_response());
        }

        tracing::debug!(path = %parts.uri.path(), error = %err, "request without valid token");
        Err(self.login_redirect(parts, err))
    }

    fn login_redirect(&self, parts: &Parts, err: &TokenError) -> Response {
        let authority = request_authority(&parts.headers, &parts.uri);
        let (host, port) = split_port(&authority);
        let login_at = port.map_or_else(
            || self.config.login_authority(),
            |port| format!("{}:{port}", self.config.hostname),
        );

        let body = format!(
            "error extracting token: {}<meta http-equiv=\"Refresh\" content=\"0; url=https://{login_at}#login\"/>",
            err.public_reason()
        );
        let response = (
            StatusCode::UNAUTHORIZED,
            [(CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        );

        if host == self.config.hostname || parts.uri.path() == "/favicon.ico" {
            return response.into_response();
        }

        let target = format!(
            "{authority}{}?{}",
            parts.uri.path(),
            parts.uri.query().unwrap_or_default()
        );
        let value: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        let ttl = i64::try_from(REDIRECT_COOKIE_TTL.as_secs()).unwrap_or(60);
        let cookie = Cookie::build((REDIRECT_COOKIE, value))
            .domain(self.config.hostname.clone())
            .path("/")
            .secure(!self.config.debug)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(ttl))
            .build();

        (CookieJar::new().add(cookie), response).into_response()
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}

/// [`Authorizer`] backed by session tokens.
#[derive(Debug, Clone)]
pub struct TokenAuthorizer {
    state: Arc<AuthState>,
}

impl TokenAuthorizer {
    /// Authorize against `state`.
    #[must_use]
    pub const fn new(state: Arc<AuthState>) -> Self {
        Self { state }
    }
}

impl Authorizer for TokenAuthorizer {
    fn wrap(&self, handler: Router, policy: AccessPolicy) -> Router {
        let guard = Guard {
            state: self.state.clone(),
            policy: Arc::new(policy),
        };
        handler.layer(middleware::from_fn_with_state(guard, authorize))
    }
}

#[derive(Clone)]
struct Guard {
    state: Arc<AuthState>,
    policy: Arc<AccessPolicy>,
}

async fn authorize(State(guard): State<Guard>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    match guard.state.check(&parts, &guard.policy).await {
        Ok(principal) => {
            parts.extensions.insert(principal);
            next.run(Request::from_parts(parts, body)).await
        }
        Err(response) => response,
    }
}

fn is_legacy_client(parts: &Parts) -> bool {
    parts
        .headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|agent| LEGACY_CLIENT_SIGNATURES.iter().any(|s| agent.contains(s)))
}

fn legacy_challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"server\""),
        )],
        "webdav client authentication",
    )
        .into_response()
}

fn verify_xsrf(parts: &Parts, principal: &SessionPrincipal) -> Result<(), AuthError> {
    let provided = parts
        .headers
        .get(XSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let expected = principal.xsrf_token.as_bytes();

    if expected.is_empty() || !bool::from(provided.as_bytes().ct_eq(expected)) {
        return Err(AuthError::XsrfMismatch);
    }
    Ok(())
}

/// Whether a URL restriction admits `host` + `path`.
///
/// Restrictions starting with `/` bind the path on any host; others bind
/// `host/path`, optionally written with an `http(s)://` prefix.
fn url_allowed(restriction: &str, host: &str, path: &str) -> bool {
    if restriction.starts_with('/') {
        return restriction == path;
    }
    let restriction = restriction
        .strip_prefix("https://")
        .or_else(|| restriction.strip_prefix("http://"))
        .unwrap_or(restriction);
    restriction
        .strip_prefix(host)
        .is_some_and(|rest| rest == path)
}

/// Extractor for the principal of an authorized request.
///
/// Only available behind an [`Authorizer`].
#[derive(Debug, Clone)]
pub struct Authenticated(pub SessionPrincipal);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionPrincipal>()
            .cloned()
            .map(Self)
            .ok_or(AuthError::Token(TokenError::NotFound))
    }
}

/// Error response for auth failures.
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Token(_) => (StatusCode::UNAUTHORIZED, "invalid_token"),
            Self::InvalidCredentials => (StatusCode::FORBIDDEN, "invalid_credentials"),
            Self::ForbiddenRole { .. } => (StatusCode::FORBIDDEN, "forbidden_role"),
            Self::XsrfMismatch => (StatusCode::UNAUTHORIZED, "xsrf_mismatch"),
            Self::ScopeMismatch(_) => (StatusCode::UNAUTHORIZED, "scope_mismatch"),
            Self::ReadOnly => (StatusCode::FORBIDDEN, "read_only"),
            Self::InvalidState => (StatusCode::INTERNAL_SERVER_ERROR, "invalid_state"),
            Self::ProviderExchange(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Storage(_) | Self::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let error = match &self {
            Self::Token(e) => e.public_reason().to_string(),
            other => other.to_string(),
        };

        (status, Json(AuthErrorResponse { error, code })).into_response()
    }
}
