//! Download routes
//!
//! - `GET /api/v1/files/:id/download`: file with current metadata; on
//!   generation failure a JSON error carrying `fallback_url`
//! - `GET /api/v1/files/:id/download/original`: the stored file, untouched
//! - `GET /opds/v1/files/:id/download`: like the first, but falls back to the
//!   original file silently
//! - `GET /api/v1/cache/stats`: cache counters

use std::path::{Path as FsPath, PathBuf};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use tokio_util::io::ReaderStream;

use crate::cache::CacheStats;
use crate::error::{AppError, Result};
use crate::formats::DownloadFormat;
use crate::library::{format_name, Book, File, FileId};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id/download", get(download))
        .route("/:id/download/original", get(download_original))
}

pub fn opds_router() -> Router<AppState> {
    Router::new().route("/:id/download", get(opds_download))
}

pub fn cache_router() -> Router<AppState> {
    Router::new().route("/stats", get(cache_stats))
}

/// Where a client can fetch the unmodified file
pub fn original_url(file_id: FileId) -> String {
    format!("/api/v1/files/{}/download/original", file_id)
}

async fn snapshot(state: &AppState, file_id: FileId) -> Result<(Book, File)> {
    state
        .library()
        .file_snapshot(file_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("File {} not found", file_id)))
}

/// Download with current metadata, surfacing generation errors
async fn download(State(state): State<AppState>, Path(file_id): Path<FileId>) -> Result<Response> {
    let (book, file) = snapshot(&state, file_id).await?;

    let path = match DownloadFormat::for_file_type(file.file_type) {
        Some(format) => state
            .cache()
            .get_or_generate(file_id, format, &file.path, &book, &file)
            .await
            .map_err(|source| AppError::Generation {
                source,
                fallback_url: original_url(file_id),
            })?,
        None => state.cache().serve_original(&file.path).await?,
    };

    stream_file(&path, &book, &file).await
}

/// Download the stored file without regeneration
async fn download_original(
    State(state): State<AppState>,
    Path(file_id): Path<FileId>,
) -> Result<Response> {
    let (book, file) = snapshot(&state, file_id).await?;
    let path = state.cache().serve_original(&file.path).await?;
    stream_file(&path, &book, &file).await
}

/// Download for OPDS readers, which cannot show our error body
async fn opds_download(State(state): State<AppState>, Path(file_id): Path<FileId>) -> Result<Response> {
    let (book, file) = snapshot(&state, file_id).await?;

    let path: PathBuf = match DownloadFormat::for_file_type(file.file_type) {
        Some(format) => {
            state
                .cache()
                .get_or_original(file_id, format, &file.path, &book, &file)
                .await?
        }
        None => state.cache().serve_original(&file.path).await?,
    };

    stream_file(&path, &book, &file).await
}

async fn cache_stats(State(state): State<AppState>) -> Result<Json<CacheStats>> {
    Ok(Json(state.cache().stats().await?))
}

/// `Content-Disposition` value with an ASCII fallback and the UTF-8 name
pub fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    )
}

async fn stream_file(path: &FsPath, book: &Book, file: &File) -> Result<Response> {
    let handle = tokio::fs::File::open(path).await?;
    let size = handle.metadata().await?.len();
    let body = Body::from_stream(ReaderStream::new(handle));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.file_type.mime_type())
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&format_name(book, file)))
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}
