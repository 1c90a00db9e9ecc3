//! Defines routes for the folder download API.
//!
//! ## Structure
//! - `GET    /health`: liveness, uptime and memory
//! - `GET    /folder`: list folders with file counts
//! - `POST   /folder`: load a shared folder link
//! - `GET    /folder/{folder_id}`: folder detail with files
//! - `DELETE /folder/{folder_id}`: remove folder, files and rows
//! - `POST   /folder/{folder_id}/retry`: re-queue failed and pending files
//! - `GET    /folder/{folder_id}/{node_id}`: download a completed file

use crate::{
    handlers::{
        folder_handlers::{
            delete_folder, download_file, get_folder, list_folders, load_folder, retry_folder,
        },
        health_handlers::health,
    },
    services::fetch_service::FetchService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the router. It carries `FetchService` as shared state to all
/// handlers; request bodies are capped at `body_limit` bytes.
pub fn routes(body_limit: usize) -> Router<FetchService> {
    Router::new()
        .route("/health", get(health))
        .route("/folder", get(list_folders).post(load_folder))
        .route("/folder/{folder_id}", get(get_folder).delete(delete_folder))
        .route("/folder/{folder_id}/retry", post(retry_folder))
        .route("/folder/{folder_id}/{node_id}", get(download_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
