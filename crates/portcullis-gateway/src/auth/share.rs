//! Share tokens: narrowed, expiring copies of a session.
//!
//! A share token keeps the issuer's roles, so it can never reach more than
//! the issuer could. It is usually bound to one URL and often read-only.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use portcullis_core::SessionPrincipal;
use serde::{Deserialize, Serialize};

use super::AuthError;
use super::middleware::{AuthState, Authenticated};

/// Seconds in a lifespan unit.
const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Body of a share request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareRequest {
    /// Label of the party the token is for.
    #[serde(default, rename = "sharedfor")]
    pub shared_for: String,

    /// URL the token is bound to, as `host/path` or `/path`.
    #[serde(default)]
    pub url: String,

    /// Lifetime in days.
    #[serde(default)]
    pub lifespan: i64,

    /// Whether only safe methods are allowed.
    #[serde(default)]
    pub readonly: bool,
}

/// Derive the principal carried by a share token.
///
/// # Errors
///
/// `BadRequest` when the URL is empty or the lifespan is not positive.
pub fn derive_principal(
    owner: &SessionPrincipal,
    request: &ShareRequest,
) -> Result<SessionPrincipal, AuthError> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(AuthError::BadRequest("url cannot be empty".to_string()));
    }
    if request.lifespan < 1 {
        return Err(AuthError::BadRequest(
            "lifespan must be at least one day".to_string(),
        ));
    }

    let mut user = owner.user.clone();
    user.login = format!("{}_share_for_{}", owner.user.login, request.shared_for);
    user.is_admin = false;

    Ok(SessionPrincipal {
        user,
        url: Some(url.to_string()),
        readonly: request.readonly,
        sharing_user_login: request.shared_for.clone(),
        xsrf_token: String::new(),
    })
}

/// Expiry of a share token issued at `now`.
#[must_use]
pub const fn share_expiry(now: i64, lifespan_days: i64) -> i64 {
    now.saturating_add(lifespan_days.saturating_mul(SECONDS_PER_DAY))
}

/// `POST /api/common/Share`: the token, as plain text.
pub async fn handle_share(
    State(auth): State<Arc<AuthState>>,
    Authenticated(owner): Authenticated,
    Json(request): Json<ShareRequest>,
) -> Response {
    let principal = match derive_principal(&owner, &request) {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };

    let expires_at = share_expiry(auth.tokens.now(), request.lifespan);
    match auth.tokens.create_token(&principal, expires_at) {
        Ok(token) => {
            tracing::info!(
                owner = %owner.user.login,
                shared_for = %request.shared_for,
                url = %request.url,
                readonly = request.readonly,
                "share token issued"
            );
            ([(CONTENT_TYPE, "text/plain; charset=utf-8")], token).into_response()
        }
        Err(e) => AuthError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_core::User;
    use pretty_assertions::assert_eq;

    fn owner(admin: bool) -> SessionPrincipal {
        let mut roles = vec!["USERS".to_string()];
        if admin {
            roles.push("ADMINS".to_string());
        }
        SessionPrincipal {
            user: User {
                id: 9,
                login: "alice".to_string(),
                roles,
                is_admin: admin,
                ..User::default()
            },
            xsrf_token: "owner-xsrf".to_string(),
            ..SessionPrincipal::default()
        }
    }

    fn request(url: &str) -> ShareRequest {
        ShareRequest {
            shared_for: "bob".to_string(),
            url: url.to_string(),
            lifespan: 2,
            readonly: true,
        }
    }

    #[test]
    fn test_derived_principal() {
        let derived = derive_principal(&owner(false), &request("docs.test/doc.txt")).unwrap();
        assert_eq!(derived.user.login, "alice_share_for_bob");
        assert_eq!(derived.user.id, 9);
        assert_eq!(derived.user.roles, vec!["USERS".to_string()]);
        assert_eq!(derived.url.as_deref(), Some("docs.test/doc.txt"));
        assert!(derived.readonly);
        assert_eq!(derived.sharing_user_login, "bob");
        assert!(derived.xsrf_token.is_empty());
    }

    #[test]
    fn test_admin_flag_not_carried() {
        let derived = derive_principal(&owner(true), &request("/doc.txt")).unwrap();
        assert!(!derived.user.is_admin);
        // Roles are inherited as-is; the flag is recomputed when the token is used.
        assert!(derived.user.has_role("ADMINS"));
    }

    #[test]
    fn test_empty_url_rejected() {
        let result = derive_principal(&owner(false), &request("  "));
        assert!(matches!(result, Err(AuthError::BadRequest(msg)) if msg == "url cannot be empty"));
    }

    #[test]
    fn test_non_positive_lifespan_rejected() {
        let mut req = request("/doc.txt");
        req.lifespan = 0;
        assert!(matches!(
            derive_principal(&owner(false), &req),
            Err(AuthError::BadRequest(_))
        ));
    }

    #[test]
    fn test_share_expiry() {
        assert_eq!(share_expiry(1000, 1), 1000 + 86_400);
        assert_eq!(share_expiry(i64::MAX - 1, 5), i64::MAX);
    }

    #[test]
    fn test_request_wire_names() {
        let parsed: ShareRequest = serde_json::from_str(
            r#"{"sharedfor":"bob","url":"/x","lifespan":3,"readonly":false}"#,
        )
        .unwrap();
        assert_eq!(parsed.shared_for, "bob");
        assert_eq!(parsed.lifespan, 3);
    }
}
