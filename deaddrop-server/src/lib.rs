use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path as RoutePath, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use deaddrop_core::{
    FALLBACK_EXTENSION, UploadReceipt, encode_filename, extension_for_mime,
    filename_from_content_disposition,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;
pub const DROP_ID_BYTES: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropMeta {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no drop with id {0}")]
    NotFound(String),
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("drop metadata is corrupt: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Flat directory of drops: `<id>.bin` holds the bytes, `<id>.json` the metadata.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn put(&self, meta: &DropMeta, body: &[u8]) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let id = new_drop_id();
        let payload = serde_json::to_vec(meta)?;
        tokio::fs::write(self.body_path(&id), body).await?;
        tokio::fs::write(self.meta_path(&id), payload).await?;
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<(DropMeta, Vec<u8>), StorageError> {
        if !is_drop_id(id) {
            return Err(StorageError::NotFound(id.to_owned()));
        }
        let meta = match tokio::fs::read(self.meta_path(id)).await {
            Ok(raw) => serde_json::from_slice::<DropMeta>(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.to_owned()));
            }
            Err(err) => return Err(err.into()),
        };
        let body = tokio::fs::read(self.body_path(id)).await?;
        Ok((meta, body))
    }

    fn body_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.bin"))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

pub fn new_drop_id() -> String {
    hex::encode(rand::random::<[u8; DROP_ID_BYTES]>())
}

pub fn is_drop_id(id: &str) -> bool {
    id.len() == DROP_ID_BYTES * 2 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Name a retrieved drop is offered under.
pub fn download_filename(id: &str, meta: &DropMeta) -> String {
    match meta.filename.as_deref() {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => {
            let extension = extension_for_mime(&meta.content_type)
                .unwrap_or_else(|| FALLBACK_EXTENSION.to_owned());
            format!("{id}{extension}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    storage: Arc<Storage>,
    max_upload_bytes: usize,
}

impl AppState {
    #[must_use]
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: Arc::new(Storage::new(storage_dir)),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_upload_bytes(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/deaddrop", post(upload_handler))
        .route("/deaddrop/{id}", get(retrieve_handler))
        .route("/healthz", get(healthz_handler))
        .layer(body_limit)
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "deaddrop listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn upload_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let meta = DropMeta {
        content_type: header_text(&headers, header::CONTENT_TYPE).unwrap_or_default(),
        filename: header_text(&headers, header::CONTENT_DISPOSITION)
            .as_deref()
            .and_then(filename_from_content_disposition),
    };

    match state.storage.put(&meta, &body).await {
        Ok(id) => {
            info!(
                "POST /deaddrop stored {} ({} bytes, {:?})",
                id,
                body.len(),
                meta.filename
            );
            Json(UploadReceipt { id }).into_response()
        }
        Err(err) => {
            error!("POST /deaddrop failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to store upload").into_response()
        }
    }
}

async fn retrieve_handler(
    State(state): State<AppState>,
    RoutePath(raw_id): RoutePath<String>,
) -> Response {
    // Share links carry the original extension after the id.
    let id = raw_id.split('.').next().unwrap_or_default();

    let (meta, body) = match state.storage.get(id).await {
        Ok(found) => found,
        Err(StorageError::NotFound(_)) => {
            info!("GET /deaddrop/{} not found", raw_id);
            return (StatusCode::NOT_FOUND, "file not found").into_response();
        }
        Err(err) => {
            error!("GET /deaddrop/{} failed: {}", raw_id, err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read upload").into_response();
        }
    };

    let filename = download_filename(id, &meta);
    let mut headers = HeaderMap::new();
    if !meta.content_type.is_empty()
        && let Ok(value) = HeaderValue::from_str(&meta.content_type)
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    match disposition_header(&filename) {
        Some(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        None => warn!("GET /deaddrop/{} has an unrepresentable filename", raw_id),
    }

    info!("GET /deaddrop/{} served {} bytes", raw_id, body.len());
    (StatusCode::OK, headers, body).into_response()
}

fn header_text(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

// Non-ASCII names go out percent-encoded; clients decode them back.
fn disposition_header(filename: &str) -> Option<HeaderValue> {
    let filename = if filename.is_ascii() {
        filename.to_owned()
    } else {
        encode_filename(filename)
    };
    HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")).ok()
}
