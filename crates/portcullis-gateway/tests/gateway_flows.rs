//! End-to-end flows through the full host-dispatching router.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use portcullis_core::{SessionPrincipal, User};
use portcullis_gateway::auth::oauth2::IdentityProvider;
use portcullis_gateway::auth::{Account, AuthError, ManualClock, UserStore, XSRF_HEADER};
use portcullis_gateway::{AuthConfig, Gateway, GatewayConfig, GatewayError, RegistryError};
use tempfile::TempDir;
use tower::ServiceExt;

const GATE: &str = "gate.test";
const START: i64 = 1_700_000_000;
const DAY: i64 = 86_400;

struct StubProvider;

#[async_trait]
impl IdentityProvider for StubProvider {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://idp.test/authorize?state={state}")
    }

    async fn exchange_code(&self, code: &str) -> Result<String, AuthError> {
        if code == "good" {
            Ok("access".to_string())
        } else {
            Err(AuthError::ProviderExchange("bad code".to_string()))
        }
    }

    async fn user_info(&self, _access_token: &str) -> Result<User, AuthError> {
        Ok(User {
            id: 42,
            login: "dave".to_string(),
            roles: vec!["CN=USERS,OU=groups".to_string()],
            is_admin: true,
            ..User::default()
        })
    }
}

struct Harness {
    _temp: TempDir,
    router: Router,
    clock: Arc<ManualClock>,
}

fn write_fixtures(dir: &Path) {
    let files = dir.join("files");
    std::fs::create_dir_all(&files).unwrap();
    std::fs::write(files.join("doc.txt"), "shared content").unwrap();
    std::fs::write(files.join("other.txt"), "private content").unwrap();

    std::fs::write(dir.join("apps.json"), "[]").unwrap();
    std::fs::write(
        dir.join("davs.json"),
        serde_json::json!([{
            "id": 1,
            "host": "files.test",
            "root": files,
            "secured": true,
            "roles": ["USERS"]
        }])
        .to_string(),
    )
    .unwrap();

    UserStore::new(dir.join("users.json"))
        .upsert(
            Account::new(
                User {
                    login: "alice".to_string(),
                    roles: vec!["USERS".to_string()],
                    ..User::default()
                },
                "wonderland",
            )
            .unwrap(),
        )
        .unwrap();
}

fn gateway_config(dir: &Path) -> GatewayConfig {
    let auth = AuthConfig::builder()
        .hostname(GATE)
        .key_file(dir.join("token.key"))
        .users_file(dir.join("users.json"))
        .build();
    GatewayConfig {
        auth,
        apps_file: dir.join("apps.json"),
        davs_file: dir.join("davs.json"),
        static_dir: dir.join("web"),
        ..GatewayConfig::default()
    }
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    write_fixtures(temp.path());

    let clock = Arc::new(ManualClock::new(START));
    let gateway = Gateway::builder()
        .with_config(gateway_config(temp.path()))
        .with_clock(clock.clone())
        .with_identity_provider(Arc::new(StubProvider))
        .build()
        .await
        .unwrap();

    Harness {
        router: gateway.router(),
        _temp: temp,
        clock,
    }
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn login(&self) -> (String, SessionPrincipal) {
        let response = self
            .send(
                Request::post("/Login")
                    .header(header::HOST, GATE)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"login":"alice","password":"wonderland"}"#))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = cookie_pair(&response, "auth_token").unwrap();
        let principal: SessionPrincipal = serde_json::from_str(&text(response).await).unwrap();
        (cookie, principal)
    }
}

fn cookie_pair(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|c| c.starts_with(&format!("{name}=")))
        .and_then(|c| c.split(';').next())
        .map(str::to_string)
}

async fn text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn get(host: &str, path: &str) -> axum::http::request::Builder {
    Request::get(path).header(header::HOST, host)
}

#[tokio::test]
async fn test_login_then_dav_access_with_xsrf() {
    let h = harness().await;

    let response = h
        .send(get("files.test", "/doc.txt").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(cookie_pair(&response, "redirectAfterLogin").is_some());
    assert!(text(response).await.contains("url=https://gate.test#login"));

    let (cookie, principal) = h.login().await;
    assert_eq!(principal.user.login, "alice");
    assert!(!principal.user.is_admin);

    let response = h
        .send(
            get("files.test", "/doc.txt")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(text(response).await.contains("xsrf_mismatch"));

    let response = h
        .send(
            get("files.test", "/doc.txt")
                .header(header::COOKIE, &cookie)
                .header(XSRF_HEADER, &principal.xsrf_token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "shared content");

    // WhoAmI does not ask for the XSRF header.
    let response = h
        .send(
            get(GATE, "/api/common/WhoAmI")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Admin endpoints need the admin role.
    let response = h
        .send(
            get(GATE, "/api/admin/users")
                .header(header::COOKIE, &cookie)
                .header(XSRF_HEADER, &principal.xsrf_token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    h.clock.advance(DAY);
    let response = h
        .send(
            get("files.test", "/doc.txt")
                .header(header::COOKIE, &cookie)
                .header(XSRF_HEADER, &principal.xsrf_token)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_share_token_is_scoped_and_read_only() {
    let h = harness().await;
    let (cookie, principal) = h.login().await;

    let response = h
        .send(
            Request::post("/api/common/Share")
                .header(header::HOST, GATE)
                .header(header::COOKIE, &cookie)
                .header(XSRF_HEADER, &principal.xsrf_token)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"sharedfor":"bob","url":"files.test/doc.txt","lifespan":1,"readonly":true}"#,
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = text(response).await;

    let response = h
        .send(
            get("files.test", &format!("/doc.txt?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "shared content");

    let response = h
        .send(
            get("files.test", &format!("/other.txt?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .send(
            Request::put(format!("/doc.txt?token={token}"))
                .header(header::HOST, "files.test")
                .body(Body::from("overwrite"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    h.clock.advance(DAY);
    let response = h
        .send(
            get("files.test", &format!("/doc.txt?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_share_requires_url() {
    let h = harness().await;
    let (cookie, principal) = h.login().await;

    let response = h
        .send(
            Request::post("/api/common/Share")
                .header(header::HOST, GATE)
                .header(header::COOKIE, &cookie)
                .header(XSRF_HEADER, &principal.xsrf_token)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"sharedfor":"bob","url":"","lifespan":1}"#))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oauth2_login_normalizes_roles() {
    let h = harness().await;

    let response = h
        .send(get(GATE, "/OAuth2Login").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let state_cookie = cookie_pair(&response, "oauth2_state").unwrap();
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    let state = location.split("state=").nth(1).unwrap().to_string();

    let response = h
        .send(
            get(GATE, &format!("/OAuth2Callback?code=good&state={state}"))
                .header(header::COOKIE, &state_cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/");
    let session = cookie_pair(&response, "auth_token").unwrap();

    let response = h
        .send(
            get(GATE, "/api/common/WhoAmI")
                .header(header::COOKIE, &session)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let principal: SessionPrincipal = serde_json::from_str(&text(response).await).unwrap();
    assert_eq!(principal.user.login, "dave");
    assert_eq!(principal.user.roles, vec!["USERS".to_string()]);
    // Never trusted from the provider.
    assert!(!principal.user.is_admin);
}

#[tokio::test]
async fn test_oauth2_state_mismatch() {
    let h = harness().await;

    let response = h
        .send(get(GATE, "/OAuth2Login").body(Body::empty()).unwrap())
        .await;
    let state_cookie = cookie_pair(&response, "oauth2_state").unwrap();

    let response = h
        .send(
            get(GATE, "/OAuth2Callback?code=good&state=forged")
                .header(header::COOKIE, &state_cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(text(response).await.contains("invalid oauth state"));
}

#[tokio::test]
async fn test_unknown_host_and_health() {
    let h = harness().await;

    let response = h
        .send(get("nowhere.test", "/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(text(response).await, "Not found.");

    let response = h
        .send(get(GATE, "/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_definition_file_is_fatal_at_startup() {
    let temp = TempDir::new().unwrap();
    write_fixtures(temp.path());
    std::fs::remove_file(temp.path().join("apps.json")).unwrap();

    let result = Gateway::builder()
        .with_config(gateway_config(temp.path()))
        .build()
        .await;
    assert!(matches!(
        result,
        Err(GatewayError::Registry(RegistryError::Unreadable { .. }))
    ));
}

#[tokio::test]
async fn test_share_with_path_only_url() {
    let h = harness().await;
    let (cookie, principal) = h.login().await;

    let response = h
        .send(
            Request::post("/api/common/Share")
                .header(header::HOST, GATE)
                .header(header::COOKIE, &cookie)
                .header(XSRF_HEADER, &principal.xsrf_token)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"sharedfor":"bob","url":"/doc.txt","lifespan":1,"readonly":true}"#,
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = text(response).await;

    // A path restriction holds on any host serving that path.
    let response = h
        .send(
            get("files.test:443", &format!("/doc.txt?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "shared content");

    let response = h
        .send(
            get("files.test", &format!("/other.txt?token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(text(response).await.contains("token restricted to url"));
}

#[tokio::test]
async fn test_legacy_webdav_client_can_browse() {
    let h = harness().await;
    let basic = |password: &str| {
        use base64::Engine;
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("alice:{password}"))
        )
    };
    let propfind = |authorization: String| {
        Request::builder()
            .method("PROPFIND")
            .uri("/")
            .header(header::HOST, "files.test")
            .header(header::USER_AGENT, "Microsoft-WebDAV-MiniRedir/10.0.19045")
            .header(header::AUTHORIZATION, authorization)
            .header("depth", "1")
            .body(Body::empty())
            .unwrap()
    };

    let response = h.send(propfind(basic("wonderland"))).await;
    assert_eq!(response.status(), StatusCode::MULTI_STATUS);
    let xml = text(response).await;
    assert!(xml.contains("<D:href>/doc.txt</D:href>"));
    assert!(xml.contains("<D:href>/other.txt</D:href>"));

    let response = h.send(propfind(basic("wrong"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"server\""
    );
}

#[tokio::test]
async fn test_browser_hardening_headers() {
    let h = harness().await;

    // Pre-flights from the gateway's pages reach secured davs without a token.
    let response = h
        .send(
            Request::options("/doc.txt")
                .header(header::HOST, "files.test")
                .header(header::ORIGIN, "https://gate.test")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "xsrf-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://gate.test"
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
        "true"
    );

    // Refusals carry the CORS headers too, so the page can read them.
    let response = h
        .send(
            get("files.test", "/doc.txt")
                .header(header::ORIGIN, "https://gate.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://gate.test"
    );

    let response = h
        .send(get(GATE, "/health").body(Body::empty()).unwrap())
        .await;
    let headers = response.headers();
    assert_eq!(headers[header::STRICT_TRANSPORT_SECURITY], "max-age=63072000");
    assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert!(
        headers[header::CONTENT_SECURITY_POLICY]
            .to_str()
            .unwrap()
            .ends_with("frame-ancestors *.gate.test:*")
    );
}
