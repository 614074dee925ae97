//! OAuth2 authorization-code login.
//!
//! `GET /OAuth2Login` stores a random state in a short-lived cookie and
//! sends the browser to the provider. `/OAuth2Callback` checks the state,
//! exchanges the code, fetches the user and issues a session cookie.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Form, Router,
    extract::{Query, State},
    http::{StatusCode, header::LOCATION},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use axum_extra::extract::cookie::CookieJar;
use portcullis_core::{SessionPrincipal, User, config::OAuth2Config, types::normalize_role};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use url::Url;

use super::config::{OAUTH_STATE_COOKIE, OAUTH_STATE_TTL};
use super::middleware::AuthState;
use super::tokens::random_value;
use super::AuthError;

/// Bytes of entropy in the state and XSRF values.
const RANDOM_VALUE_BYTES: usize = 16;

/// An OAuth2 identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// URL of the authorization endpoint carrying `state`.
    fn authorize_url(&self, state: &str) -> String;

    /// Exchange an authorization code for an access token.
    async fn exchange_code(&self, code: &str) -> Result<String, AuthError>;

    /// Fetch the profile of the token's owner.
    async fn user_info(&self, access_token: &str) -> Result<User, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Discovery {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    userinfo_endpoint: Option<String>,
    #[serde(default)]
    end_session_endpoint: Option<String>,
}

/// [`IdentityProvider`] speaking OAuth2 over HTTP.
#[derive(Debug, Clone)]
pub struct OAuth2Client {
    config: OAuth2Config,
    auth_url: Url,
    token_url: Url,
    userinfo_url: Url,
    http: reqwest::Client,
}

impl OAuth2Client {
    /// Build a client, discovering missing endpoints from the issuer when
    /// one is configured.
    ///
    /// # Errors
    ///
    /// `Config` when an endpoint is missing or not a URL,
    /// `ProviderExchange` when discovery fails.
    pub async fn connect(mut config: OAuth2Config) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Config(format!("HTTP client: {e}")))?;

        let needs_discovery = config.auth_url.is_empty()
            || config.token_url.is_empty()
            || config.userinfo_url.is_empty();
        if needs_discovery && !config.issuer_url.is_empty() {
            discover(&http, &mut config).await?;
        }

        let parse = |name: &str, value: &str| {
            Url::parse(value).map_err(|e| AuthError::Config(format!("oauth2 {name} '{value}': {e}")))
        };
        Ok(Self {
            auth_url: parse("authUrl", &config.auth_url)?,
            token_url: parse("tokenUrl", &config.token_url)?,
            userinfo_url: parse("userinfoUrl", &config.userinfo_url)?,
            config,
            http,
        })
    }

    /// Effective configuration, including discovered endpoints.
    #[must_use]
    pub const fn config(&self) -> &OAuth2Config {
        &self.config
    }
}

async fn discover(http: &reqwest::Client, config: &mut OAuth2Config) -> Result<(), AuthError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        config.issuer_url.trim_end_matches('/')
    );
    let document: Discovery = http
        .get(&url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| AuthError::ProviderExchange(format!("discovery at {url}: {e}")))?
        .json()
        .await
        .map_err(|e| AuthError::ProviderExchange(format!("discovery document: {e}")))?;

    if config.auth_url.is_empty() {
        config.auth_url = document.authorization_endpoint;
    }
    if config.token_url.is_empty() {
        config.token_url = document.token_endpoint;
    }
    if config.userinfo_url.is_empty() {
        config.userinfo_url = document.userinfo_endpoint.unwrap_or_default();
    }
    if config.logout_url.is_empty() {
        config.logout_url = document.end_session_endpoint.unwrap_or_default();
    }
    tracing::info!(issuer = %config.issuer_url, "discovered identity provider endpoints");
    Ok(())
}

#[async_trait]
impl IdentityProvider for OAuth2Client {
    fn authorize_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        url.into()
    }

    async fn exchange_code(&self, code: &str) -> Result<String, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_url.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(self.token_url.clone())
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::ProviderExchange(format!("code exchange: {e}")))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::ProviderExchange(format!("token response: {e}")))?;
        parse_token_response(&content_type, &body)
    }

    async fn user_info(&self, access_token: &str) -> Result<User, AuthError> {
        let mut url = self.userinfo_url.clone();
        url.query_pairs_mut().append_pair("access_token", access_token);

        self.http
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::ProviderExchange(format!("user info: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::ProviderExchange(format!("user info document: {e}")))
    }
}

/// Extract the access token from a token endpoint reply.
///
/// Some providers answer in `application/x-www-form-urlencoded` (or
/// `text/plain`) rather than JSON.
fn parse_token_response(content_type: &str, body: &[u8]) -> Result<String, AuthError> {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    let token = if matches!(media_type, "application/x-www-form-urlencoded" | "text/plain") {
        url::form_urlencoded::parse(body)
            .find(|(key, _)| key == "access_token")
            .map(|(_, value)| value.into_owned())
    } else {
        serde_json::from_slice::<TokenResponse>(body)
            .map_err(|e| AuthError::ProviderExchange(format!("token response: {e}")))
            .map(|t| Some(t.access_token))?
    };
    token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::ProviderExchange("token response without access_token".to_string()))
}

/// State shared by the OAuth2 handlers.
pub struct OAuth2Flow {
    /// Session issuance.
    pub auth: Arc<AuthState>,
    /// The identity provider.
    pub provider: Arc<dyn IdentityProvider>,
}

impl std::fmt::Debug for OAuth2Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Flow").finish_non_exhaustive()
    }
}

/// Query or form parameters of the callback.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code.
    #[serde(default)]
    pub code: Option<String>,
    /// Echoed state.
    #[serde(default)]
    pub state: Option<String>,
    /// Error reported by the provider.
    #[serde(default)]
    pub error: Option<String>,
}

/// `/OAuth2Login` and `/OAuth2Callback`.
pub fn routes(flow: Arc<OAuth2Flow>) -> Router {
    Router::new()
        .route("/OAuth2Login", get(handle_login))
        .route(
            "/OAuth2Callback",
            get(handle_callback_query).post(handle_callback_form),
        )
        .with_state(flow)
}

async fn handle_login(State(flow): State<Arc<OAuth2Flow>>) -> Response {
    let state = random_value(RANDOM_VALUE_BYTES);
    let cookie = match flow.auth.tokens.store_in_cookie(
        &state,
        &flow.auth.config.hostname,
        OAUTH_STATE_COOKIE,
        OAUTH_STATE_TTL,
    ) {
        Ok(cookie) => cookie,
        Err(e) => return AuthError::from(e).into_response(),
    };

    let target = flow.provider.authorize_url(&state);
    (CookieJar::new().add(cookie), Redirect::temporary(&target)).into_response()
}

async fn handle_callback_query(
    State(flow): State<Arc<OAuth2Flow>>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    complete_login(&flow, jar, params).await
}

async fn handle_callback_form(
    State(flow): State<Arc<OAuth2Flow>>,
    jar: CookieJar,
    Form(params): Form<CallbackParams>,
) -> Response {
    complete_login(&flow, jar, params).await
}

async fn complete_login(flow: &OAuth2Flow, jar: CookieJar, params: CallbackParams) -> Response {
    let tokens = &flow.auth.tokens;
    let hostname = flow.auth.config.hostname.as_str();

    let expected = match jar.get(OAUTH_STATE_COOKIE) {
        Some(cookie) => match tokens.unstore::<String>(cookie.value()) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "oauth2 state cookie rejected");
                return found("/");
            }
        },
        None => {
            tracing::debug!("oauth2 callback without state cookie");
            return found("/");
        }
    };

    let received = params.state.unwrap_or_default();
    if !bool::from(received.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!("oauth2 state mismatch");
        return AuthError::InvalidState.into_response();
    }

    let jar = jar.add(tokens.removal_cookie(OAUTH_STATE_COOKIE, hostname));

    if let Some(error) = params.error {
        tracing::warn!(%error, "identity provider returned an error");
        return (jar, found("/")).into_response();
    }
    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        tracing::warn!("oauth2 callback without code");
        return (jar, found("/")).into_response();
    };

    let mut user = match fetch_user(flow.provider.as_ref(), &code).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(error = %e, "oauth2 login failed");
            return (jar, found("/")).into_response();
        }
    };
    user.roles = user.roles.iter().map(|r| normalize_role(r)).collect();
    user.is_admin = user.has_role(&flow.auth.config.admin_role);

    let principal = SessionPrincipal {
        user,
        xsrf_token: random_value(RANDOM_VALUE_BYTES),
        ..SessionPrincipal::default()
    };
    let cookie = match flow.auth.session_cookie(&principal) {
        Ok(cookie) => cookie,
        Err(e) => return e.into_response(),
    };

    tracing::info!(login = %principal.user.login, "user logged in via oauth2");
    (jar.add(cookie), found("/")).into_response()
}

async fn fetch_user(provider: &dyn IdentityProvider, code: &str) -> Result<User, AuthError> {
    let access_token = provider.exchange_code(code).await?;
    provider.user_info(&access_token).await
}

/// 302 to `location`.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}
