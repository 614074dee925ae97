//! Check whether the gateway would serve a host name.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use portcullis_core::SessionKey;
use portcullis_gateway::auth::{AuthState, UserStore};
use portcullis_gateway::{Gateway, GatewayConfig, TokenManager};

use crate::ui;

/// Report whether `host` is the gateway host or a registered backend.
///
/// Loads the definition files the way `serve` does, with a throwaway
/// token key and without contacting the identity provider.
///
/// # Errors
///
/// Returns error if the definitions cannot be loaded or the host is unknown.
pub async fn run_check_host(config_file: Option<&Path>, host: &str) -> Result<()> {
    let config = super::load_config(config_file)?;
    let mut gateway_config = GatewayConfig::from(&config);
    gateway_config.oauth2 = None;

    let auth = AuthState::new(
        gateway_config.auth.clone(),
        TokenManager::new(SessionKey::generate(), gateway_config.auth.debug),
        Arc::new(UserStore::new(gateway_config.auth.users_file.clone())),
    );
    let gateway = Gateway::builder()
        .with_config(gateway_config)
        .with_auth_state(Arc::new(auth))
        .build()
        .await?;

    match gateway.host_policy(host).await {
        Ok(()) => {
            ui::success(&format!("{host} is served by this gateway"));
            Ok(())
        }
        Err(e) => {
            ui::error(&e.to_string());
            Err(e.into())
        }
    }
}
