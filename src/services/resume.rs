//! Startup reconciliation of persisted state.
//!
//! Runs once before the scheduler starts: transfers interrupted by the last
//! shutdown are put back to `pending`, then every folder with pending files is
//! reopened and its resolvable files are queued.

use super::{
    fetch_service::{FetchResult, FetchService},
    remote_source::FolderRef,
};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    /// Rows found in `downloading` and reset to `pending`.
    pub orphaned: u64,
    /// Folders whose pending files were queued.
    pub folders: usize,
    /// Jobs queued across those folders.
    pub queued: usize,
    /// Folders skipped because their handle could not be opened.
    pub skipped: usize,
}

pub async fn resume(service: &FetchService) -> FetchResult<ResumeReport> {
    let mut report = ResumeReport {
        orphaned: service.store().reset_orphaned_downloads().await?,
        ..ResumeReport::default()
    };

    for folder in service.store().folders_with_pending_files().await? {
        let reference = FolderRef::new(folder.folder_id.clone(), folder.folder_key.clone());
        let handle = match service.handles().get_or_open(&reference).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    "could not reopen folder {} on resume, skipping: {}",
                    folder.folder_id, err
                );
                report.skipped += 1;
                continue;
            }
        };

        report.queued += service.requeue_pending(&handle).await?;
        report.folders += 1;
    }

    info!(
        "resume: {} interrupted transfers reset, {} jobs queued from {} folders ({} skipped)",
        report.orphaned, report.queued, report.folders, report.skipped
    );
    Ok(report)
}
