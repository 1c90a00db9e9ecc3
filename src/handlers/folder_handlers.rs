//! HTTP handlers for folder operations.
//! Downloaded files are streamed from disk; everything else is small JSON
//! delegated to `FetchService`.

use crate::{
    errors::AppError,
    models::folder::{FolderDetail, FolderSummary},
    services::fetch_service::FetchService,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;

/// Body of `POST /folder`.
#[derive(Debug, Deserialize)]
pub struct LoadFolderReq {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadFolderResp {
    pub folder_id: String,
    pub name: String,
    pub file_count: u64,
    pub message: String,
}

/// GET `/folder`: every folder with per-status file counts.
pub async fn list_folders(
    State(service): State<FetchService>,
) -> Result<Json<Vec<FolderSummary>>, AppError> {
    Ok(Json(service.list_folders().await?))
}

/// POST `/folder`: open a shared link and start downloading it.
pub async fn load_folder(
    State(service): State<FetchService>,
    payload: Result<Json<LoadFolderReq>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(req) = payload?;
    let url = req
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("`url` is required"))?;

    let loaded = service.load_folder(&url).await?;
    let body = LoadFolderResp {
        message: format!(
            "Folder loaded, {} files queued for download",
            loaded.file_count
        ),
        folder_id: loaded.folder_id,
        name: loaded.name,
        file_count: loaded.file_count,
    };
    Ok((StatusCode::CREATED, Json(body)))
}

/// GET `/folder/{folder_id}`: folder with all of its files.
pub async fn get_folder(
    State(service): State<FetchService>,
    Path(folder_id): Path<String>,
) -> Result<Json<FolderDetail>, AppError> {
    Ok(Json(service.folder_detail(&folder_id).await?))
}

/// GET `/folder/{folder_id}/{node_id}`: stream a downloaded file.
pub async fn download_file(
    State(service): State<FetchService>,
    Path((folder_id, node_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let completed = service.open_completed_file(&folder_id, &node_id).await?;
    let body = Body::from_stream(ReaderStream::new(completed.file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(completed.len));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&completed.record.name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// DELETE `/folder/{folder_id}`
pub async fn delete_folder(
    State(service): State<FetchService>,
    Path(folder_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.remove_folder(&folder_id).await?;
    Ok(Json(json!({
        "message": format!("Folder {folder_id} removed")
    })))
}

/// POST `/folder/{folder_id}/retry`: re-queue failed and pending files.
pub async fn retry_folder(
    State(service): State<FetchService>,
    Path(folder_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let count = service.retry_folder(&folder_id).await?;
    Ok(Json(json!({
        "message": format!("{count} files queued for retry"),
        "count": count
    })))
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 encoded
/// UTF-8 filename.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();

    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
