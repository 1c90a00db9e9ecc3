//! Periodic retry of rate-limited folders.

use super::fetch_service::FetchService;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry every rate-limited folder once. Per-folder failures are logged and
/// do not stop the sweep. Returns how many folders were retried.
pub async fn sweep_rate_limited(service: &FetchService) -> usize {
    let folders = match service.store().rate_limited_folders().await {
        Ok(folders) => folders,
        Err(err) => {
            warn!("could not list rate limited folders: {}", err);
            return 0;
        }
    };
    if folders.is_empty() {
        debug!("retry sweep: no rate limited folders");
        return 0;
    }

    let mut retried = 0;
    for folder in &folders {
        match service.retry_folder(&folder.folder_id).await {
            Ok(count) => {
                info!(
                    "retry sweep: folder {} resumed with {} files",
                    folder.folder_id, count
                );
                retried += 1;
            }
            Err(err) => warn!(
                "retry sweep: folder {} failed: {}",
                folder.folder_id, err
            ),
        }
    }
    info!(
        "retry sweep finished: {}/{} rate limited folders retried",
        retried,
        folders.len()
    );
    retried
}

/// Run `sweep_rate_limited` every `every` until `cancel` fires.
pub fn spawn_retry_sweeper(
    service: FetchService,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sweep_rate_limited(&service).await;
                }
                _ = cancel.cancelled() => {
                    info!("retry sweeper shutting down");
                    break;
                }
            }
        }
    })
}
