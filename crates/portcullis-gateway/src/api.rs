//! Listing and administration endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;

use crate::auth::{
    AccessPolicy, Account, AuthError, AuthState, Authenticated, Authorizer, UserStore, share,
};
use crate::auth::handlers::handle_whoami;
use crate::registry::{AppEntry, DavEntry, Registry, RegistryError};

/// Shared state of the gateway's own routes.
#[derive(Clone, FromRef)]
pub struct GatewayState {
    /// Sessions and tokens.
    pub auth: Arc<AuthState>,
    /// Application registry.
    pub apps: Arc<Registry<AppEntry>>,
    /// Dav registry.
    pub davs: Arc<Registry<DavEntry>>,
    /// Local accounts.
    pub users: Arc<UserStore>,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("apps", &self.apps)
            .field("davs", &self.davs)
            .field("users", &self.users)
            .finish_non_exhaustive()
    }
}

/// `/api/common/*` and `/api/admin/*`, each guarded by `authorizer`.
pub fn routes(state: GatewayState, authorizer: &dyn Authorizer) -> Router {
    let admin_role = state.auth.config.admin_role.clone();

    let whoami = Router::new()
        .route("/api/common/WhoAmI", get(handle_whoami))
        .with_state(state.clone());

    let common = Router::new()
        .route("/api/common/apps", get(list_apps))
        .route("/api/common/davs", get(list_davs))
        .route("/api/common/Share", post(share::handle_share))
        .with_state(state.clone());

    let admin = Router::new()
        .route("/api/admin/reload", get(reload))
        .route("/api/admin/apps", get(admin_list_apps).post(upsert_app))
        .route("/api/admin/apps/{id}", delete(delete_app))
        .route("/api/admin/davs", get(admin_list_davs).post(upsert_dav))
        .route("/api/admin/davs/{id}", delete(delete_dav))
        .route("/api/admin/users", get(list_users).post(upsert_user))
        .route("/api/admin/users/{id}", delete(delete_user))
        .with_state(state);

    Router::new()
        .merge(authorizer.wrap(whoami, AccessPolicy::any_user(false)))
        .merge(authorizer.wrap(common, AccessPolicy::any_user(true)))
        .merge(authorizer.wrap(admin, AccessPolicy::new([admin_role], true)))
}

/// Error response for registry failures.
#[derive(Debug, Serialize)]
struct RegistryErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Unreadable { .. } | Self::Parse { .. } | Self::Json(_) => {
                (StatusCode::BAD_REQUEST, "invalid_definitions")
            }
            Self::InvalidEntry { .. } => (StatusCode::BAD_REQUEST, "invalid_entry"),
            Self::UnrecognizedHost(_) => (StatusCode::NOT_FOUND, "unrecognized_host"),
            Self::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = RegistryErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

async fn list_apps(
    State(state): State<GatewayState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<Vec<AppEntry>>, RegistryError> {
    let apps = state.apps.read_entries().await?;
    if principal.user.is_admin {
        return Ok(Json(apps));
    }
    Ok(Json(apps.iter().map(AppEntry::without_credentials).collect()))
}

async fn list_davs(State(state): State<GatewayState>) -> Result<Json<Vec<DavEntry>>, RegistryError> {
    Ok(Json(state.davs.read_entries().await?))
}

async fn reload(State(state): State<GatewayState>) -> Result<&'static str, RegistryError> {
    state.apps.reload().await?;
    state.davs.reload().await?;
    tracing::info!("apps and davs reloaded on request");
    Ok("apps and davs services reloaded")
}

async fn admin_list_apps(
    State(state): State<GatewayState>,
) -> Result<Json<Vec<AppEntry>>, RegistryError> {
    Ok(Json(state.apps.read_entries().await?))
}

async fn upsert_app(
    State(state): State<GatewayState>,
    Authenticated(principal): Authenticated,
    Json(entry): Json<AppEntry>,
) -> Result<Json<AppEntry>, RegistryError> {
    let saved = state.apps.upsert(entry).await?;
    tracing::info!(admin = %principal.user.login, id = saved.id, host = %saved.host, "app saved");
    Ok(Json(saved))
}

async fn delete_app(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, RegistryError> {
    Ok(removed_status(state.apps.delete(id).await?))
}

async fn admin_list_davs(
    State(state): State<GatewayState>,
) -> Result<Json<Vec<DavEntry>>, RegistryError> {
    Ok(Json(state.davs.read_entries().await?))
}

async fn upsert_dav(
    State(state): State<GatewayState>,
    Authenticated(principal): Authenticated,
    Json(entry): Json<DavEntry>,
) -> Result<Json<DavEntry>, RegistryError> {
    let saved = state.davs.upsert(entry).await?;
    tracing::info!(admin = %principal.user.login, id = saved.id, host = %saved.host, "dav saved");
    Ok(Json(saved))
}

async fn delete_dav(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, RegistryError> {
    Ok(removed_status(state.davs.delete(id).await?))
}

async fn list_users(State(state): State<GatewayState>) -> Result<Json<Vec<Account>>, AuthError> {
    let users = state.users.clone();
    let accounts = tokio::task::spawn_blocking(move || users.list())
        .await
        .map_err(|e| AuthError::Storage(e.to_string()))??;
    Ok(Json(accounts.iter().map(Account::to_public).collect()))
}

async fn upsert_user(
    State(state): State<GatewayState>,
    Authenticated(principal): Authenticated,
    Json(account): Json<Account>,
) -> Result<Json<Account>, AuthError> {
    let users = state.users.clone();
    let saved = tokio::task::spawn_blocking(move || users.upsert(account))
        .await
        .map_err(|e| AuthError::Storage(e.to_string()))??;
    tracing::info!(admin = %principal.user.login, login = %saved.user.login, "user saved");
    Ok(Json(saved.to_public()))
}

async fn delete_user(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AuthError> {
    let users = state.users.clone();
    let removed = tokio::task::spawn_blocking(move || users.delete(id))
        .await
        .map_err(|e| AuthError::Storage(e.to_string()))??;
    Ok(removed_status(removed))
}

const fn removed_status(removed: bool) -> StatusCode {
    if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
