use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, HeaderName, Method},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::UploadError;
use crate::file_server::{basename, FileServer};
use crate::vllm::{Inference, VllmClient};

/// Extensions accepted for upload. Matching is case-sensitive.
pub const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

pub const DEFAULT_BODY_LIMIT: usize = 32 * 1024 * 1024;

/// Attempts at finding a free stored name before giving up.
const MAX_NAME_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference: Option<Inference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResponse {
    pub fn failure(error: String) -> Self {
        UploadResponse {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Optional form fields sent alongside the file.
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub prompt: Option<String>,
}

#[derive(Debug)]
struct UploadedFile {
    filename: String,
    bytes: axum::body::Bytes,
}

/// Accepts image uploads, stores them and asks the vision model about them.
#[derive(Debug, Clone)]
pub struct ApiServer {
    storage: PathBuf,
    files: FileServer,
    vllm: VllmClient,
    public_host: String,
    body_limit: usize,
}

impl ApiServer {
    pub fn new(
        storage: impl Into<PathBuf>,
        files: FileServer,
        vllm: VllmClient,
        public_host: &str,
    ) -> Self {
        ApiServer {
            storage: storage.into(),
            files,
            vllm,
            public_host: public_host.to_string(),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.body_limit = bytes;
        self
    }

    pub fn router(self) -> Router {
        let body_limit = self.body_limit;

        Router::new()
            .route("/api/upload", post(upload_handler))
            .layer(DefaultBodyLimit::max(body_limit))
            .with_state(Arc::new(self))
            .route("/health", get(health_check))
            .layer(crate::utils::cors_layer(
                vec![
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                    Method::PATCH,
                ],
                vec![
                    header::ORIGIN,
                    header::CONTENT_TYPE,
                    header::CONTENT_LENGTH,
                    header::ACCEPT_ENCODING,
                    HeaderName::from_static("x-csrf-token"),
                    header::AUTHORIZATION,
                    header::ACCEPT,
                    header::CACHE_CONTROL,
                    HeaderName::from_static("x-requested-with"),
                ],
            ))
            .layer(crate::utils::trace_layer())
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("api server listening on {}", addr);
        info!("upload endpoint: http://localhost:{}/api/upload", addr.port());

        axum::Server::try_bind(&addr)?
            .serve(self.router().into_make_service())
            .await?;
        Ok(())
    }

    async fn store(&self, file: &UploadedFile) -> Result<String, UploadError> {
        tokio::fs::create_dir_all(&self.storage)
            .await
            .map_err(UploadError::CreateDir)?;

        write_unique(&self.storage, basename(&file.filename), &file.bytes, stored_name)
            .await
            .map_err(UploadError::Write)
    }
}

/// Writes `bytes` under the first name from `make_name` that is not taken yet.
async fn write_unique<F>(
    dir: &Path,
    original: &str,
    bytes: &[u8],
    mut make_name: F,
) -> std::io::Result<String>
where
    F: FnMut(&str) -> String,
{
    let mut attempt = 0;
    loop {
        let filename = make_name(original);
        match write_new(&dir.join(&filename), bytes).await {
            Ok(()) => return Ok(filename),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                attempt += 1;
                if attempt >= MAX_NAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

async fn upload_handler(
    State(api): State<Arc<ApiServer>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, UploadError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|len| len > api.body_limit) {
        return Err(UploadError::TooLarge {
            limit: api.body_limit,
        });
    }

    let multipart = multipart.map_err(|rejection| UploadError::Multipart(rejection.body_text()))?;
    let (file, request) = read_form(multipart, api.body_limit).await?;

    let extension = extension_of(&file.filename);
    if !is_allowed_extension(&extension) {
        return Err(UploadError::UnsupportedExtension(extension));
    }

    let filename = api.store(&file).await?;
    info!("stored upload {} ({} bytes)", filename, file.bytes.len());

    let image_url = api.files.file_url(&filename, &api.public_host);

    let response = match api.vllm.infer_image(&image_url, request.prompt.as_deref()).await {
        Ok(inference) => UploadResponse {
            success: true,
            message: Some("file uploaded and inference completed".to_string()),
            image_url: Some(image_url),
            inference: Some(inference),
            error: None,
        },
        Err(err) => {
            warn!("inference failed for {}: {}", filename, err);
            UploadResponse {
                success: true,
                message: Some("file uploaded, but inference failed".to_string()),
                image_url: Some(image_url),
                inference: None,
                error: Some(format!("inference failed: {}", err)),
            }
        }
    };

    Ok(Json(response))
}

async fn read_form(
    mut multipart: Multipart,
    body_limit: usize,
) -> Result<(UploadedFile, UploadRequest), UploadError> {
    let mut file = None;
    let mut request = UploadRequest::default();

    // Bodies without a Content-Length only hit the limit while streaming.
    let form_error = |err: axum::extract::multipart::MultipartError| {
        UploadError::Multipart(format!(
            "{} (request bodies are limited to {} bytes)",
            err, body_limit
        ))
    };

    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") if file.is_none() => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(form_error)?;
                file = Some(UploadedFile { filename, bytes });
            }
            Some("prompt") => {
                let prompt = field.text().await.map_err(form_error)?;
                request.prompt = Some(prompt).filter(|prompt| !prompt.is_empty());
            }
            _ => {}
        }
    }

    match file {
        Some(file) if !file.filename.is_empty() => Ok((file, request)),
        _ => Err(UploadError::MissingFile),
    }
}

/// Text from the last `.` of the basename on, or an empty string. A leading dot counts,
/// so `.png` has the extension `.png`.
fn extension_of(filename: &str) -> String {
    let name = basename(filename);
    name.rfind('.')
        .map(|dot| name[dot..].to_string())
        .unwrap_or_default()
}

fn is_allowed_extension(extension: &str) -> bool {
    extension
        .strip_prefix('.')
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext))
}

/// `{unix nanos}_{original}`.
fn stored_name(original: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{}_{}", nanos, original)
}

async fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut out = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let written = match out.write_all(bytes).await {
        Ok(()) => out.flush().await,
        Err(err) => Err(err),
    };
    if let Err(err) = written {
        drop(out);
        discard_partial(path).await;
        return Err(err);
    }
    Ok(())
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove partial upload {}: {}", path.display(), err),
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "api_server" }))
}
