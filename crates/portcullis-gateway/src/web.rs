//! The gateway's own web front-end, served from a directory.

use std::path::PathBuf;

use axum::{
    Router,
    http::{HeaderValue, header::CACHE_CONTROL},
};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::set_header::SetResponseHeaderLayer;

/// Router serving the files under `root`.
///
/// Paths that match no file get `index.html`, so client-side routes
/// survive a reload. Nothing is cached by the browser.
pub fn router(root: impl Into<PathBuf>) -> Router {
    let root = root.into();
    let index = ServeFile::new(root.join("index.html"));
    Router::new()
        .fallback_service(ServeDir::new(root).fallback(index))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store, must-revalidate"),
        ))
}
