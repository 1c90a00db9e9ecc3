//! Health handler.
//!
//! - GET /health -> liveness with process uptime and resident memory

use crate::services::fetch_service::FetchService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

/// `GET /health`
///
/// Always 200 while the process serves requests. Memory is reported as 0
/// when the platform does not expose it.
pub async fn health(State(service): State<FetchService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
            uptime: service.uptime().as_secs(),
            memory_mb: resident_memory_mb().unwrap_or(0),
        }),
    )
}

fn resident_memory_mb() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    system
        .process(pid)
        .map(|process| process.memory() / (1024 * 1024))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    /// Seconds since startup.
    uptime: u64,
    #[serde(rename = "memoryMB")]
    memory_mb: u64,
}
