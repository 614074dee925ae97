//! Routes each request by its `Host` header.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tower::ServiceExt;

use crate::host::{request_authority, strip_port};
use crate::registry::{AppEntry, DavEntry, Registry, RegistryError};

/// Chooses between the gateway's own routes and the registered backends.
pub struct HostDispatcher {
    hostname: String,
    main: Router,
    apps: Arc<Registry<AppEntry>>,
    davs: Arc<Registry<DavEntry>>,
}

impl HostDispatcher {
    /// Dispatcher serving `main` on `hostname` and the registries elsewhere.
    pub fn new(
        hostname: impl Into<String>,
        main: Router,
        apps: Arc<Registry<AppEntry>>,
        davs: Arc<Registry<DavEntry>>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            main,
            apps,
            davs,
        }
    }

    /// Handler for `host`, apps before davs.
    pub async fn route_for(&self, host: &str) -> Option<Router> {
        let host = strip_port(host);
        if host == self.hostname {
            return Some(self.main.clone());
        }
        if let Some(handler) = self.apps.find(host).await {
            return Some(handler);
        }
        self.davs.find(host).await
    }

    /// Whether a certificate may be issued for `host`.
    ///
    /// # Errors
    ///
    /// `UnrecognizedHost` when neither the gateway nor a backend serves it.
    pub async fn host_policy(&self, host: &str) -> Result<(), RegistryError> {
        let host = strip_port(host);
        if host == self.hostname
            || self.apps.find(host).await.is_some()
            || self.davs.find(host).await.is_some()
        {
            return Ok(());
        }
        Err(RegistryError::UnrecognizedHost(host.to_string()))
    }

    /// Router that dispatches every request.
    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new().fallback(dispatch).with_state(self)
    }
}

async fn dispatch(State(dispatcher): State<Arc<HostDispatcher>>, request: Request) -> Response {
    let authority = request_authority(request.headers(), request.uri());
    match dispatcher.route_for(&authority).await {
        Some(handler) => handler
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {}),
        None => {
            tracing::debug!(host = %authority, "no backend for host");
            (StatusCode::NOT_FOUND, "Not found.").into_response()
        }
    }
}

impl std::fmt::Debug for HostDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDispatcher")
            .field("hostname", &self.hostname)
            .field("apps", &self.apps)
            .field("davs", &self.davs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessPolicy, Authorizer};
    use crate::registry::{DavHandlerFactory, HandlerFactory};
    use axum::body::Body;
    use axum::http::header::HOST;
    use tempfile::TempDir;

    struct Passthrough;

    impl Authorizer for Passthrough {
        fn wrap(&self, handler: Router, _policy: AccessPolicy) -> Router {
            handler
        }
    }

    struct NamedApp;

    impl HandlerFactory<AppEntry> for NamedApp {
        fn build(&self, entry: &AppEntry) -> Result<Router, RegistryError> {
            let name = entry.name.clone();
            Ok(Router::new().fallback(move || async move { name }))
        }
    }

    fn dispatcher(temp: &TempDir) -> HostDispatcher {
        let apps_file = temp.path().join("apps.json");
        let davs_file = temp.path().join("davs.json");
        let root = temp.path().join("files");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), "from dav").unwrap();

        std::fs::write(
            &apps_file,
            r#"[{"id":1,"name":"wiki","host":"wiki.test"},{"id":2,"name":"shadow","host":"files.test"}]"#,
        )
        .unwrap();
        std::fs::write(
            &davs_file,
            serde_json::json!([
                {"id": 1, "host": "files.test", "root": root},
                {"id": 2, "host": "*.dav.test", "root": root}
            ])
            .to_string(),
        )
        .unwrap();

        let apps = Arc::new(Registry::new(apps_file, Arc::new(NamedApp), Arc::new(Passthrough)));
        let davs = Arc::new(Registry::new(
            davs_file,
            Arc::new(DavHandlerFactory::new("gate.test", 443)),
            Arc::new(Passthrough),
        ));
        let main = Router::new().fallback(|| async { "main" });
        HostDispatcher::new("gate.test", main, apps, davs)
    }

    async fn get(router: &Router, host: &str, path: &str) -> (StatusCode, String) {
        let response = router
            .clone()
            .oneshot(
                Request::get(path)
                    .header(HOST, host)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_dispatch_by_host() {
        let temp = TempDir::new().unwrap();
        let router = Arc::new(dispatcher(&temp)).into_router();

        assert_eq!(get(&router, "gate.test:8443", "/").await.1, "main");
        assert_eq!(get(&router, "wiki.test", "/").await.1, "wiki");
        // Apps are consulted before davs.
        assert_eq!(get(&router, "files.test", "/a.txt").await.1, "shadow");
        assert_eq!(get(&router, "x.dav.test", "/a.txt").await.1, "from dav");

        let (status, body) = get(&router, "unknown.test", "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Not found.");
    }

    #[tokio::test]
    async fn test_host_policy() {
        let temp = TempDir::new().unwrap();
        let dispatcher = dispatcher(&temp);

        assert!(dispatcher.host_policy("gate.test").await.is_ok());
        assert!(dispatcher.host_policy("wiki.test:443").await.is_ok());
        assert!(dispatcher.host_policy("dav.test").await.is_ok());
        assert!(matches!(
            dispatcher.host_policy("evil.test").await,
            Err(RegistryError::UnrecognizedHost(host)) if host == "evil.test"
        ));
    }
}
