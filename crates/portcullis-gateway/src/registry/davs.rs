//! File-serving endpoints.
//!
//! Davs serve files read-only. `PROPFIND` answers with the properties of
//! a file or a directory and its children so WebDAV clients can browse.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    Router,
    extract::{Request, State},
    http::{
        HeaderValue, Method, StatusCode,
        header::{ALLOW, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use super::{BackendEntry, HandlerFactory, RegistryError};
use crate::security::{SecurityHeaders, dav_cors};

/// Bytes escaped in a path segment of an href. Covers the XML specials.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Methods a dav answers.
const DAV_ALLOW: &str = "OPTIONS, GET, HEAD, PROPFIND";

/// A file-serving endpoint definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DavEntry {
    /// Identifier.
    #[serde(default)]
    pub id: i64,
    /// Host name or `*.domain` pattern.
    pub host: String,
    /// Directory served.
    pub root: String,
    /// Whether write methods are accepted.
    #[serde(default)]
    pub writable: bool,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Icon name for the portal.
    #[serde(default)]
    pub icon: String,
    /// Tile colour for the portal.
    #[serde(default)]
    pub color: String,
    /// Whether requests must be authorized.
    #[serde(default)]
    pub secured: bool,
    /// Roles admitted when secured.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl BackendEntry for DavEntry {
    const KIND: &'static str = "dav";
    const REQUIRES_XSRF: bool = true;

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn secured(&self) -> bool {
        self.secured
    }

    fn roles(&self) -> &[String] {
        &self.roles
    }
}

/// Builds read-only file servers for davs.
#[derive(Debug, Clone, Default)]
pub struct DavHandlerFactory {
    hostname: String,
    public_port: u16,
}

impl DavHandlerFactory {
    /// Factory for davs of the gateway at `hostname`, reached by browsers
    /// on `public_port`.
    pub fn new(hostname: impl Into<String>, public_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            public_port,
        }
    }
}

impl HandlerFactory<DavEntry> for DavHandlerFactory {
    fn build(&self, entry: &DavEntry) -> Result<Router, RegistryError> {
        if entry.root.trim().is_empty() {
            return Err(RegistryError::InvalidEntry {
                kind: DavEntry::KIND,
                id: entry.id,
                reason: "root is empty".to_string(),
            });
        }

        let dav = Arc::new(DavRoot {
            root: PathBuf::from(&entry.root),
            writable: entry.writable,
        });
        Ok(Router::new()
            .fallback_service(ServeDir::new(&entry.root))
            .layer(middleware::from_fn_with_state(dav, dav_methods)))
    }

    fn decorate(&self, _entry: &DavEntry, handler: Router) -> Router {
        SecurityHeaders::for_davs(&self.hostname)
            .apply(handler)
            .layer(dav_cors(&self.hostname, self.public_port))
    }
}

struct DavRoot {
    root: PathBuf,
    writable: bool,
}

async fn dav_methods(State(dav): State<Arc<DavRoot>>, request: Request, next: Next) -> Response {
    let method = request.method();
    if method == Method::GET || method == Method::HEAD {
        return next.run(request).await;
    }
    if method == Method::OPTIONS {
        return (
            StatusCode::OK,
            [("dav", "1"), (ALLOW.as_str(), DAV_ALLOW)],
        )
            .into_response();
    }
    if method.as_str() == "PROPFIND" {
        return propfind(&dav.root, request).await;
    }

    if dav.writable {
        (StatusCode::NOT_IMPLEMENTED, "not implemented").into_response()
    } else {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed : dav is read only",
        )
            .into_response()
    }
}

/// One `<D:response>` of a multistatus document.
struct Resource {
    href: String,
    collection: bool,
    length: u64,
    modified: Option<SystemTime>,
}

impl Resource {
    fn new(href: String, metadata: &std::fs::Metadata) -> Self {
        Self {
            href,
            collection: metadata.is_dir(),
            length: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// `Depth: 0` describes the target only; any other depth adds the
/// children of a directory.
async fn propfind(root: &Path, request: Request) -> Response {
    let not_found = || (StatusCode::NOT_FOUND, "Not Found").into_response();

    let Some(segments) = path_segments(request.uri().path()) else {
        return not_found();
    };
    let target = segments.iter().fold(root.to_path_buf(), |path, s| path.join(s));
    let Ok(metadata) = tokio::fs::metadata(&target).await else {
        return not_found();
    };

    let shallow = request
        .headers()
        .get("depth")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|depth| depth.trim() == "0");

    let mut resources = vec![Resource::new(href(&segments, metadata.is_dir()), &metadata)];
    if metadata.is_dir() && !shallow {
        match children(&target, &segments).await {
            Ok(children) => resources.extend(children),
            Err(e) => {
                tracing::warn!(path = %target.display(), error = %e, "cannot list dav directory");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    (
        StatusCode::MULTI_STATUS,
        [(CONTENT_TYPE, HeaderValue::from_static("application/xml; charset=utf-8"))],
        multistatus(&resources),
    )
        .into_response()
}

async fn children(dir: &Path, segments: &[String]) -> std::io::Result<Vec<Resource>> {
    let mut listing = tokio::fs::read_dir(dir).await?;
    let mut resources = Vec::new();
    while let Some(entry) = listing.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let Ok(metadata) = tokio::fs::metadata(entry.path()).await else {
            continue;
        };
        let mut path = segments.to_vec();
        path.push(name);
        resources.push(Resource::new(href(&path, metadata.is_dir()), &metadata));
    }
    resources.sort_by(|a, b| a.href.cmp(&b.href));
    Ok(resources)
}

/// Decoded segments of a request path, or `None` when it leaves the root.
fn path_segments(path: &str) -> Option<Vec<String>> {
    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    let mut segments = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s if s.contains('\\') => return None,
            s => segments.push(s.to_string()),
        }
    }
    Some(segments)
}

fn href(segments: &[String], collection: bool) -> String {
    let mut href = String::new();
    for segment in segments {
        href.push('/');
        href.extend(utf8_percent_encode(segment, SEGMENT));
    }
    if collection || href.is_empty() {
        href.push('/');
    }
    href
}

fn multistatus(resources: &[Resource]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><D:multistatus xmlns:D="DAV:">"#);
    for resource in resources {
        xml.push_str("<D:response><D:href>");
        xml.push_str(&resource.href);
        xml.push_str("</D:href><D:propstat><D:prop>");
        if resource.collection {
            xml.push_str("<D:resourcetype><D:collection/></D:resourcetype>");
        } else {
            xml.push_str(&format!(
                "<D:resourcetype/><D:getcontentlength>{}</D:getcontentlength>",
                resource.length
            ));
        }
        if let Some(modified) = resource.modified {
            let modified = DateTime::<Utc>::from(modified).format("%a, %d %b %Y %H:%M:%S GMT");
            xml.push_str(&format!("<D:getlastmodified>{modified}</D:getlastmodified>"));
        }
        xml.push_str("</D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>");
    }
    xml.push_str("</D:multistatus>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn factory() -> DavHandlerFactory {
        DavHandlerFactory::new("gate.test", 443)
    }

    fn entry(temp: &TempDir, writable: bool) -> DavEntry {
        std::fs::write(temp.path().join("doc.txt"), "content").unwrap();
        std::fs::create_dir_all(temp.path().join("sub dir")).unwrap();
        std::fs::write(temp.path().join("sub dir/a&b.txt"), "x").unwrap();
        DavEntry {
            id: 1,
            host: "files.test".to_string(),
            root: temp.path().to_string_lossy().into_owned(),
            writable,
            ..DavEntry::default()
        }
    }

    fn dav(temp: &TempDir, writable: bool) -> Router {
        factory().build(&entry(temp, writable)).unwrap()
    }

    fn propfind_request(path: &str, depth: &str) -> Request {
        Request::builder()
            .method("PROPFIND")
            .uri(path)
            .header("depth", depth)
            .body(Body::empty())
            .unwrap()
    }

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_reads_files() {
        let temp = TempDir::new().unwrap();
        let response = dav(&temp, false)
            .oneshot(Request::get("/doc.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "content");
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let temp = TempDir::new().unwrap();
        let response = dav(&temp, false)
            .oneshot(Request::put("/doc.txt").body(Body::from("new")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body(response).await, "method not allowed : dav is read only");
        assert_eq!(std::fs::read_to_string(temp.path().join("doc.txt")).unwrap(), "content");
    }

    #[tokio::test]
    async fn test_writable_dav_writes_not_implemented() {
        let temp = TempDir::new().unwrap();
        let response = dav(&temp, true)
            .oneshot(Request::delete("/doc.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_options_advertises_dav() {
        let temp = TempDir::new().unwrap();
        let response = dav(&temp, false)
            .oneshot(Request::options("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["dav"], "1");
        assert!(response.headers()[ALLOW].to_str().unwrap().contains("PROPFIND"));
    }

    #[tokio::test]
    async fn test_propfind_lists_directory() {
        let temp = TempDir::new().unwrap();
        let response = dav(&temp, false)
            .oneshot(propfind_request("/", "1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MULTI_STATUS);
        assert!(
            response.headers()[CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("application/xml")
        );

        let xml = body(response).await;
        assert_eq!(xml.matches("<D:response>").count(), 3);
        assert!(xml.contains("<D:href>/</D:href><D:propstat><D:prop><D:resourcetype><D:collection/>"));
        assert!(xml.contains("<D:href>/doc.txt</D:href>"));
        assert!(xml.contains("<D:getcontentlength>7</D:getcontentlength>"));
        assert!(xml.contains("<D:href>/sub%20dir/</D:href>"));
        assert!(xml.contains("GMT</D:getlastmodified>"));
    }

    #[tokio::test]
    async fn test_propfind_depth_zero_and_escaping() {
        let temp = TempDir::new().unwrap();
        let router = dav(&temp, false);

        let response = router
            .clone()
            .oneshot(propfind_request("/sub%20dir/", "0"))
            .await
            .unwrap();
        let xml = body(response).await;
        assert_eq!(xml.matches("<D:response>").count(), 1);

        let response = router
            .oneshot(propfind_request("/sub%20dir", "1"))
            .await
            .unwrap();
        let xml = body(response).await;
        assert!(xml.contains("<D:href>/sub%20dir/a%26b.txt</D:href>"));
        assert!(!xml.contains("a&b"));
    }

    #[tokio::test]
    async fn test_propfind_outside_root_or_missing() {
        let temp = TempDir::new().unwrap();
        let router = dav(&temp, false);
        for path in ["/missing.txt", "/../etc", "/%2e%2e/etc"] {
            let response = router.clone().oneshot(propfind_request(path, "1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }

    #[tokio::test]
    async fn test_decorated_dav_has_cors_and_security_headers() {
        let temp = TempDir::new().unwrap();
        let entry = entry(&temp, false);
        let router = factory().decorate(&entry, factory().build(&entry).unwrap());

        let response = router
            .oneshot(
                Request::get("/doc.txt")
                    .header("origin", "https://gate.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "https://gate.test");
        assert_eq!(headers["access-control-allow-credentials"], "true");
        assert_eq!(headers["strict-transport-security"], "max-age=63072000");
        assert!(
            headers["content-security-policy"]
                .to_str()
                .unwrap()
                .contains("frame-ancestors *.gate.test:* gate.test:*")
        );
    }

    #[test]
    fn test_empty_root_is_invalid() {
        let entry = DavEntry {
            host: "files.test".to_string(),
            ..DavEntry::default()
        };
        assert!(factory().build(&entry).is_err());
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("/").unwrap(), Vec::<String>::new());
        assert_eq!(path_segments("/a%20b/./c").unwrap(), vec!["a b", "c"]);
        assert!(path_segments("/a/../b").is_none());
        assert!(path_segments("/a%2F..%2Fb").is_none());
        assert_eq!(href(&["a b".to_string()], true), "/a%20b/");
        assert_eq!(href(&[], true), "/");
    }
}
