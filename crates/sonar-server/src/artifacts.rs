//! HTTP side of the artifact flow: upload, history, and the error type they share.
//!
//! An upload is streamed to disk, appended to the artifact log, and only then
//! announced to live subscribers, so the pushed event matches what
//! `GET /api/audios` returns afterwards.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sonar_core::time::iso_now;
use sonar_core::DeviceName;
use sonar_store::artifacts::DEFAULT_HISTORY_LIMIT;
use sonar_store::{ArtifactRecord, NewArtifact};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::server::AppState;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9_\-]+").unwrap());

const ALLOWED_EXTENSION: &str = "wav";

/// Errors returned by the artifact routes, mapped to HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    BadRequest(String),
    #[error("file too large (> {0} bytes)")]
    TooLarge(u64),
    #[error("{0}")]
    Internal(String),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            error: self.to_string(),
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

/// Body returned after a successful upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub filename: String,
    pub size: u64,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Turn an uploaded file name into a safe stem: lowercase, whitespace runs
/// become `_`, and anything outside `[a-z0-9_-]` is dropped.
pub fn slugify(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    let underscored = WHITESPACE.replace_all(&stem, "_");
    let slug = DISALLOWED.replace_all(&underscored, "");
    if slug.is_empty() {
        "audio".to_string()
    } else {
        slug.into_owned()
    }
}

fn has_allowed_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ALLOWED_EXTENSION))
}

/// A file written to the upload directory.
#[derive(Debug)]
struct StoredFile {
    original_name: String,
    filename: String,
    path: PathBuf,
    size: u64,
    mime_type: String,
}

/// Create `<stem>_<stamp>.wav`, adding a numeric suffix if that name is taken.
async fn create_unique(dir: &Path, stem: &str) -> std::io::Result<(String, PathBuf, fs::File)> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let mut attempt = 0u32;
    loop {
        let filename = if attempt == 0 {
            format!("{stem}_{stamp}.{ALLOWED_EXTENSION}")
        } else {
            format!("{stem}_{stamp}_{attempt}.{ALLOWED_EXTENSION}")
        };
        let path = dir.join(&filename);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((filename, path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < 1000 => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

async fn store_upload(
    dir: &Path,
    max_bytes: u64,
    mut field: Field<'_>,
) -> Result<StoredFile, UploadError> {
    let original_name = field
        .file_name()
        .filter(|n| !n.is_empty())
        .unwrap_or("audio.wav")
        .to_string();
    if !has_allowed_extension(&original_name) {
        return Err(UploadError::BadRequest("only .wav files are allowed".into()));
    }
    let mime_type = field.content_type().unwrap_or_default().to_string();

    fs::create_dir_all(dir)
        .await
        .map_err(|e| UploadError::Internal(format!("error saving file: {e}")))?;
    let (filename, path, mut file) = create_unique(dir, &slugify(&original_name))
        .await
        .map_err(|e| UploadError::Internal(format!("error saving file: {e}")))?;

    let mut size = 0u64;
    let written: Result<(), UploadError> = async {
        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(&e, max_bytes))? {
            size += chunk.len() as u64;
            if size > max_bytes {
                return Err(UploadError::TooLarge(max_bytes));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| UploadError::Internal(format!("error saving file: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| UploadError::Internal(format!("error saving file: {e}")))
    }
    .await;

    if let Err(e) = written {
        drop(file);
        if let Err(rm) = fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %rm, "failed to remove partial upload");
        }
        return Err(e);
    }

    Ok(StoredFile {
        original_name,
        filename,
        path,
        size,
        mime_type,
    })
}

fn multipart_error(err: &MultipartError, max_bytes: u64) -> UploadError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::TooLarge(max_bytes)
    } else {
        UploadError::BadRequest(format!("malformed multipart body: {}", err.body_text()))
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// POST /api/audio
pub async fn upload_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, UploadError> {
    let mut device_name: Option<String> = None;
    let mut latitude = String::new();
    let mut longitude = String::new();
    let mut stored: Option<StoredFile> = None;

    let result: Result<(), UploadError> = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(&e, state.config.max_upload_bytes))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "audio" if stored.is_none() => {
                    stored = Some(
                        store_upload(&state.config.upload_dir, state.config.max_upload_bytes, field)
                            .await?,
                    );
                }
                "deviceName" => device_name = Some(read_text(field).await?),
                "latitude" => latitude = read_text(field).await?,
                "longitude" => longitude = read_text(field).await?,
                _ => {}
            }
        }
        Ok(())
    }
    .await;

    let device_name = device_name.filter(|d| !d.trim().is_empty());
    let (stored, device_name) = match (result, stored, device_name) {
        (Ok(()), Some(stored), Some(device)) => (stored, device),
        (outcome, stored, device) => {
            if let Some(stored) = stored {
                let _ = fs::remove_file(&stored.path).await;
            }
            return Err(match (outcome, device) {
                (Err(e), _) => e,
                (Ok(()), None) => UploadError::BadRequest("deviceName is required".into()),
                (Ok(()), Some(_)) => UploadError::BadRequest("audio file is required".into()),
            });
        }
    };

    let row = NewArtifact {
        timestamp: iso_now(),
        device_name,
        latitude,
        longitude,
        original_name: stored.original_name,
        filename: stored.filename.clone(),
        size: stored.size,
        mime_type: stored.mime_type,
        path: stored.path.display().to_string(),
        client_ip: client_ip(&headers),
    };

    let warning = match state.artifacts.append(&row) {
        Ok(_) => None,
        Err(e) => {
            error!(filename = %row.filename, error = %e, "failed to append artifact log");
            Some(format!("could not write artifact log: {e}"))
        }
    };

    info!(device = %row.device_name, filename = %row.filename, size = row.size, "audio uploaded");
    if let Err(e) = state.notifier.notify_new_artifact(row.to_event()) {
        warn!(filename = %row.filename, error = %e, "new_audio notification not dispatched");
    }

    let status = if warning.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let body = UploadResponse {
        ok: true,
        filename: row.filename,
        size: row.size,
        path: row.path,
        warning,
    };
    Ok((status, Json(body)).into_response())
}

async fn read_text(field: Field<'_>) -> Result<String, UploadError> {
    field
        .text()
        .await
        .map_err(|e| UploadError::BadRequest(format!("malformed form field: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(rename = "deviceName", default)]
    pub device_name: String,
    pub limit: Option<i64>,
}

/// GET /api/audios?deviceName=..&limit=..
pub async fn list_audios(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ArtifactRecord>>, UploadError> {
    let device = DeviceName::normalize(&query.device_name)
        .ok_or_else(|| UploadError::BadRequest("deviceName is required".into()))?;
    let limit = query
        .limit
        .map_or(DEFAULT_HISTORY_LIMIT, |l| u32::try_from(l.max(1)).unwrap_or(u32::MAX));

    let rows = state
        .artifacts
        .list_for_device(&device, limit)
        .map_err(|e| UploadError::Internal(e.to_string()))?;
    Ok(Json(rows))
}
