use std::{
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use axum::{
    body::{boxed, Body},
    extract::{self, State},
    http::{header, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{info, warn};

use crate::utils::{cors_layer, trace_layer};

/// Serves previously uploaded files under `/files/` and builds their public URLs.
#[derive(Debug, Clone)]
pub struct FileServer {
    port: String,
    root: PathBuf,
}

impl FileServer {
    pub fn new(port: &str, root: impl Into<PathBuf>) -> Self {
        FileServer {
            port: port.to_string(),
            root: root.into(),
        }
    }

    /// Public URL of a stored file. Only the basename of `filename` is used, so directory
    /// components can never leak into the URL. An empty `host` means `localhost:{port}`.
    pub fn file_url(&self, filename: &str, host: &str) -> String {
        let host = if host.is_empty() {
            format!("localhost:{}", self.port)
        } else {
            host.to_string()
        };

        format!("http://{}/files/{}", host, basename(filename))
    }

    /// Maps a request path below `/files/` onto the storage root.
    ///
    /// Returns `None` for anything that is not a plain relative path, and for paths whose
    /// canonical form (symlinks resolved) lies outside the root.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }

        let candidate = self.root.join(relative);
        let root = self.root.canonicalize().ok()?;
        let resolved = candidate.canonicalize().ok()?;
        resolved.starts_with(&root).then_some(resolved)
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/files/*name", get(serve_file))
            .route("/health", get(health_check))
            .with_state(Arc::new(self))
            .layer(cors_layer(
                vec![Method::GET, Method::POST, Method::OPTIONS],
                vec![
                    header::ORIGIN,
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::CACHE_CONTROL,
                    header::HeaderName::from_static("x-requested-with"),
                ],
            ))
            .layer(trace_layer())
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!(
            "file server listening on {}, serving {}",
            addr,
            self.root.display()
        );
        info!("files available at http://localhost:{}/files/<filename>", addr.port());

        axum::Server::try_bind(&addr)?
            .serve(self.router().into_make_service())
            .await?;
        Ok(())
    }
}

/// Final path component of `filename`, ignoring both `/` and `\` separators.
pub fn basename(filename: &str) -> &str {
    let trimmed = filename.trim_end_matches(['/', '\\']);
    match trimmed.rsplit(['/', '\\']).next() {
        Some(name) if !name.is_empty() => name,
        _ => ".",
    }
}

async fn serve_file(
    State(files): State<Arc<FileServer>>,
    extract::Path(name): extract::Path<String>,
    request: Request<Body>,
) -> Response {
    let Some(path) = files.resolve(&name) else {
        warn!("rejected file request for {:?}", name);
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }

    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.map(boxed),
        Err(err) => match err {},
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "file_server" }))
}
