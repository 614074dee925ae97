//! Gateway server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{Router, routing::get};
use portcullis_core::config::OAuth2Config;
use tower_http::trace::TraceLayer;

use crate::GatewayError;
use crate::api::{self, GatewayState};
use crate::auth::handlers::{self, SessionEndpoints};
use crate::auth::oauth2::{self, IdentityProvider, OAuth2Client, OAuth2Flow};
use crate::auth::{AuthConfig, AuthState, Authorizer, Clock, TokenAuthorizer, UserStore};
use crate::dispatch::HostDispatcher;
use crate::registry::{AppHandlerFactory, DavHandlerFactory, Registry};
use crate::security::SecurityHeaders;
use crate::web;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port to listen on.
    pub port: u16,
    /// Bind address.
    pub bind_address: String,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// External identity provider, if any.
    pub oauth2: Option<OAuth2Config>,
    /// Application definitions.
    pub apps_file: PathBuf,
    /// Dav definitions.
    pub davs_file: PathBuf,
    /// The gateway's web front-end.
    pub static_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&portcullis_core::Config::default())
    }
}

impl From<&portcullis_core::Config> for GatewayConfig {
    fn from(config: &portcullis_core::Config) -> Self {
        Self {
            port: config.gateway.port,
            bind_address: config.gateway.bind_address.clone(),
            auth: AuthConfig::from(config),
            oauth2: config.oauth2.clone(),
            apps_file: config.backends.apps_file.clone(),
            davs_file: config.backends.davs_file.clone(),
            static_dir: config.gateway.static_dir.clone(),
        }
    }
}

/// Gateway server.
pub struct Gateway {
    config: GatewayConfig,
    state: GatewayState,
    dispatcher: Arc<HostDispatcher>,
}

/// Builder for constructing a Gateway with its dependencies.
#[derive(Default)]
pub struct GatewayBuilder {
    config: GatewayConfig,
    auth_state: Option<Arc<AuthState>>,
    provider: Option<Arc<dyn IdentityProvider>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatewayBuilder {
    /// Create a new builder with default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set gateway configuration.
    #[must_use]
    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the auth state instead of loading the key from disk.
    #[must_use]
    pub fn with_auth_state(mut self, auth: Arc<AuthState>) -> Self {
        self.auth_state = Some(auth);
        self
    }

    /// Set the identity provider instead of connecting to the configured one.
    #[must_use]
    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the clock tokens are checked against. Ignored when an auth
    /// state is supplied.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the gateway, loading both registries.
    ///
    /// # Errors
    ///
    /// Returns error if the identity provider cannot be reached or a
    /// definition file cannot be loaded.
    pub async fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;

        let auth = match self.auth_state {
            Some(auth) => auth,
            None => {
                let state = AuthState::initialize(config.auth.clone());
                let state = match self.clock {
                    Some(clock) => AuthState::new(
                        state.config,
                        state.tokens.with_clock(clock),
                        state.users,
                    ),
                    None => state,
                };
                Arc::new(state)
            }
        };

        let provider: Option<Arc<dyn IdentityProvider>> = match (self.provider, &config.oauth2) {
            (Some(provider), _) => Some(provider),
            (None, Some(oauth2)) => {
                let client = OAuth2Client::connect(oauth2.clone()).await?;
                tracing::info!(auth_url = %client.config().auth_url, "OAuth2 provider configured");
                Some(Arc::new(client))
            }
            (None, None) => None,
        };

        let authorizer: Arc<dyn Authorizer> = Arc::new(TokenAuthorizer::new(auth.clone()));
        let apps = Arc::new(Registry::new(
            config.apps_file.clone(),
            Arc::new(AppHandlerFactory::new(
                config.auth.hostname.clone(),
                config.auth.public_port,
            )?),
            authorizer.clone(),
        ));
        let davs = Arc::new(Registry::new(
            config.davs_file.clone(),
            Arc::new(DavHandlerFactory::new(
                config.auth.hostname.clone(),
                config.auth.public_port,
            )),
            authorizer.clone(),
        ));
        apps.refresh().await?;
        davs.refresh().await?;

        let state = GatewayState {
            auth: auth.clone(),
            apps: apps.clone(),
            davs: davs.clone(),
            users: Arc::new(UserStore::new(config.auth.users_file.clone())),
        };

        let logout_url = config
            .oauth2
            .as_ref()
            .map(|o| o.logout_url.clone())
            .filter(|u| !u.is_empty());
        let mut main = Router::new()
            .route("/health", get(health_handler))
            .merge(handlers::routes(Arc::new(SessionEndpoints {
                auth: auth.clone(),
                logout_url,
            })))
            .merge(api::routes(state.clone(), authorizer.as_ref()));
        if let Some(provider) = provider {
            main = main.merge(oauth2::routes(Arc::new(OAuth2Flow {
                auth: auth.clone(),
                provider,
            })));
        }
        let main = SecurityHeaders::for_gateway(&config.auth.hostname)
            .apply(main.fallback_service(web::router(config.static_dir.clone())));

        let dispatcher = Arc::new(HostDispatcher::new(
            config.auth.hostname.clone(),
            main,
            apps,
            davs,
        ));

        Ok(Gateway {
            config,
            state,
            dispatcher,
        })
    }
}

impl Gateway {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Create a gateway from configuration.
    ///
    /// # Errors
    ///
    /// See [`GatewayBuilder::build`].
    pub async fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        GatewayBuilder::new().with_config(config).build().await
    }

    /// Shared state.
    #[must_use]
    pub const fn state(&self) -> &GatewayState {
        &self.state
    }

    /// The full router: host dispatch with request tracing.
    #[must_use]
    pub fn router(&self) -> Router {
        self.dispatcher
            .clone()
            .into_router()
            .layer(TraceLayer::new_for_http())
    }

    /// Whether a certificate may be issued for `host`.
    ///
    /// # Errors
    ///
    /// `UnrecognizedHost` when nothing serves the host.
    pub async fn host_policy(&self, host: &str) -> Result<(), GatewayError> {
        Ok(self.dispatcher.host_policy(host).await?)
    }

    /// Run the gateway server until interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid or the listener fails.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| GatewayError::Config(format!("Invalid address: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(
            %addr,
            hostname = %self.config.auth.hostname,
            "Gateway listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatewayError::Server(e.to_string()))?;

        tracing::info!("Gateway stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
