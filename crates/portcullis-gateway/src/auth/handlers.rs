//! Local login, logout and who-am-i.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use portcullis_core::SessionPrincipal;
use serde::Deserialize;

use super::AuthError;
use super::middleware::{AuthState, Authenticated};
use super::tokens::random_value;

/// Body of `POST /Login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Login name.
    pub login: String,
    /// Password.
    pub password: String,
}

/// Endpoints that manage the session cookie.
#[derive(Debug)]
pub struct SessionEndpoints {
    /// Session issuance.
    pub auth: Arc<AuthState>,
    /// Where `/Logout` sends the browser.
    pub logout_url: Option<String>,
}

/// `POST /Login` and `GET /Logout`.
pub fn routes(endpoints: Arc<SessionEndpoints>) -> Router {
    Router::new()
        .route("/Login", post(handle_login))
        .route("/Logout", get(handle_logout))
        .with_state(endpoints)
}

async fn handle_login(
    State(endpoints): State<Arc<SessionEndpoints>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Response {
    let auth = endpoints.auth.clone();
    let client = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("direct")
        .to_string();

    let users = auth.users.clone();
    let login = request.login.clone();
    let verified =
        tokio::task::spawn_blocking(move || users.verify(&request.login, &request.password))
            .await
            .unwrap_or_else(|e| Err(AuthError::Storage(format!("credential check aborted: {e}"))));

    let user = match verified {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(%login, %client, error = %e, "login failed");
            return e.into_response();
        }
    };

    let mut principal = SessionPrincipal {
        user,
        xsrf_token: random_value(16),
        ..SessionPrincipal::default()
    };
    principal.user.is_admin = principal.user.has_role(&auth.config.admin_role);

    match auth.session_cookie(&principal) {
        Ok(cookie) => {
            tracing::info!(%login, %client, "user logged in");
            (CookieJar::new().add(cookie), Json(principal)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn handle_logout(State(endpoints): State<Arc<SessionEndpoints>>) -> Response {
    let auth = &endpoints.auth;
    let removal = auth
        .tokens
        .removal_cookie(&auth.config.cookie_name, &auth.config.hostname);
    let target = endpoints
        .logout_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .unwrap_or("/");
    (CookieJar::new().add(removal), Redirect::temporary(target)).into_response()
}

/// `GET /api/common/WhoAmI`: the caller's principal.
pub async fn handle_whoami(Authenticated(principal): Authenticated) -> Json<SessionPrincipal> {
    Json(principal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::config::AuthConfig;
    use crate::auth::tokens::TokenManager;
    use crate::auth::users::{Account, UserStore};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use portcullis_core::{SessionKey, User};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn endpoints(temp: &TempDir, logout_url: Option<&str>) -> Arc<SessionEndpoints> {
        let store = UserStore::new(temp.path().join("users.json"));
        store
            .upsert(
                Account::new(
                    User {
                        login: "admin".to_string(),
                        roles: vec!["ADMINS".to_string()],
                        ..User::default()
                    },
                    "secret",
                )
                .unwrap(),
            )
            .unwrap();

        let config = AuthConfig::builder().hostname("gate.test").build();
        let tokens = TokenManager::new(SessionKey::generate(), false);
        Arc::new(SessionEndpoints {
            auth: Arc::new(AuthState::new(config, tokens, Arc::new(store))),
            logout_url: logout_url.map(str::to_string),
        })
    }

    fn login(body: &str) -> Request<Body> {
        Request::post("/Login")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_sets_session_cookie() {
        let temp = TempDir::new().unwrap();
        let endpoints = endpoints(&temp, None);
        let response = routes(endpoints.clone())
            .oneshot(login(r#"{"login":"admin","password":"secret"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
        assert!(cookie.starts_with("auth_token="));
        assert!(cookie.contains("HttpOnly"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let principal: SessionPrincipal = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(principal.user.login, "admin");
        assert!(principal.user.is_admin);
        assert!(!principal.xsrf_token.is_empty());
    }

    #[tokio::test]
    async fn test_login_rejects_bad_password() {
        let temp = TempDir::new().unwrap();
        let response = routes(endpoints(&temp, None))
            .oneshot(login(r#"{"login":"admin","password":"nope"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get("set-cookie").is_none());
    }

    #[tokio::test]
    async fn test_logout() {
        let temp = TempDir::new().unwrap();
        let response = routes(endpoints(&temp, Some("https://idp.test/logout")))
            .oneshot(Request::get("/Logout").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://idp.test/logout"
        );
        let cookie = response.headers().get("set-cookie").unwrap().to_str().unwrap();
        assert!(cookie.starts_with("auth_token=;"));
        assert!(cookie.contains("Max-Age=0"));
    }
}
