//! src/services/fetch_service.rs
//!
//! FetchService: the operations behind the HTTP surface. It owns the durable
//! `StateStore`, the process-local `FolderHandleCache` and the shared
//! `Scheduler`, and is cloned into every request as router state.

use super::{
    handle_cache::FolderHandleCache,
    remote_source::{FolderRef, LinkError, RemoteFile, RemoteFolder, RemoteSource, SourceError},
    scheduler::{Job, Scheduler, SchedulerConfig},
    state_store::{NewFile, StateStore, StoreError},
};
use crate::models::{
    file::{FileRecord, FileStatus},
    folder::{FolderDetail, FolderSummary},
};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid folder url: {0}")]
    Validation(String),
    #[error("folder `{0}` not found")]
    FolderNotFound(String),
    #[error("file `{node_id}` not found in folder `{folder_id}`")]
    FileNotFound { folder_id: String, node_id: String },
    #[error("file `{node_id}` is not downloaded yet (status: {status})")]
    NotReady { node_id: String, status: FileStatus },
    #[error("folder `{0}` is already loaded")]
    AlreadyLoaded(String),
    #[error("remote source error: {0}")]
    Upstream(#[source] SourceError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::FolderNotFound(id) => FetchError::FolderNotFound(id),
            StoreError::FolderExists(id) => FetchError::AlreadyLoaded(id),
            StoreError::FileNotFound { folder_id, node_id } => {
                FetchError::FileNotFound { folder_id, node_id }
            }
            other => FetchError::Store(other),
        }
    }
}

impl From<LinkError> for FetchError {
    fn from(err: LinkError) -> Self {
        FetchError::Validation(err.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Result of a successful folder load.
#[derive(Debug, Clone)]
pub struct LoadedFolder {
    pub folder_id: String,
    pub name: String,
    pub file_count: u64,
}

/// A completed file ready to be streamed back to a client.
#[derive(Debug)]
pub struct CompletedFile {
    pub record: FileRecord,
    pub file: File,
    pub len: u64,
}

#[derive(Clone)]
pub struct FetchService {
    store: StateStore,
    handles: Arc<FolderHandleCache>,
    scheduler: Arc<Scheduler>,
    started_at: Instant,
}

impl FetchService {
    pub fn new(
        store: StateStore,
        source: Arc<dyn RemoteSource>,
        config: SchedulerConfig,
    ) -> Self {
        let scheduler = Scheduler::new(store.clone(), Arc::clone(&source), config);
        Self {
            store,
            handles: Arc::new(FolderHandleCache::new(source)),
            scheduler,
            started_at: Instant::now(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn handles(&self) -> &FolderHandleCache {
        &self.handles
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Open a shared folder link, persist the folder with all of its files as
    /// `pending` and queue one job per file.
    pub async fn load_folder(&self, url: &str) -> FetchResult<LoadedFolder> {
        let reference = FolderRef::from_link(url)?;
        let folder_id = reference.folder_id.clone();

        if self.store.find_folder(&folder_id).await?.is_some() {
            return Err(FetchError::AlreadyLoaded(folder_id));
        }

        let remote = self
            .handles
            .reload(&reference)
            .await
            .map_err(FetchError::Upstream)?;
        let name = if remote.name.trim().is_empty() {
            folder_id.clone()
        } else {
            remote.name.clone()
        };

        // The primary key settles concurrent loads of the same folder.
        self.store
            .insert_folder(&folder_id, &reference.folder_key, &name)
            .await?;

        let files: Vec<NewFile> = remote
            .files
            .iter()
            .map(|f| NewFile {
                node_id: f.node_id.clone(),
                name: f.name.clone(),
                size: i64::try_from(f.size).unwrap_or(i64::MAX),
                timestamp: f.timestamp,
            })
            .collect();
        let file_count = match self.store.insert_files(&folder_id, &files).await {
            Ok(count) => count,
            Err(err) => {
                if let Err(cleanup) = self.store.delete_folder(&folder_id).await {
                    warn!("could not roll back folder {}: {}", folder_id, cleanup);
                }
                self.handles.evict(&folder_id);
                return Err(err.into());
            }
        };

        let queued = self.requeue_pending(&remote).await?;
        info!(
            "loaded folder {} ({}): {} files, {} queued",
            folder_id, name, file_count, queued
        );

        Ok(LoadedFolder {
            folder_id,
            name,
            file_count,
        })
    }

    pub async fn list_folders(&self) -> FetchResult<Vec<FolderSummary>> {
        Ok(self.store.list_folder_summaries().await?)
    }

    pub async fn folder_detail(&self, folder_id: &str) -> FetchResult<FolderDetail> {
        let folder = self.store.get_folder(folder_id).await?;
        let files = self.store.folder_files(folder_id).await?;
        Ok(FolderDetail { folder, files })
    }

    /// Open a downloaded file. Fails with `NotReady` unless the file is
    /// `completed`, and with `FileNotFound` if it is gone from disk.
    pub async fn open_completed_file(
        &self,
        folder_id: &str,
        node_id: &str,
    ) -> FetchResult<CompletedFile> {
        let record = self.store.get_file(folder_id, node_id).await?;
        if record.status != FileStatus::Completed {
            return Err(FetchError::NotReady {
                node_id: node_id.to_string(),
                status: record.status,
            });
        }

        let path = self.scheduler.file_path(folder_id, node_id, &record.name);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    "{}/{} is completed but missing at {}",
                    folder_id,
                    node_id,
                    path.display()
                );
                return Err(FetchError::FileNotFound {
                    folder_id: folder_id.to_string(),
                    node_id: node_id.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();

        Ok(CompletedFile { record, file, len })
    }

    /// Forget a folder: drop its queued jobs, its handle, its directory and
    /// its rows. Transfers already running finish against the removed paths.
    pub async fn remove_folder(&self, folder_id: &str) -> FetchResult<()> {
        self.store.get_folder(folder_id).await?;

        let stripped = self.scheduler.strip_folder(folder_id);
        self.handles.evict(folder_id);

        let dir = self.scheduler.folder_dir(folder_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        self.store.delete_folder(folder_id).await?;
        info!(
            "removed folder {} ({} queued jobs dropped)",
            folder_id, stripped
        );
        Ok(())
    }

    /// Reset a folder's `failed` and `pending` files and queue them again
    /// against a freshly opened handle. Returns how many files were reset.
    ///
    /// The throttle is only lifted once the folder reopens. A remote failure
    /// while reopening is logged, not returned: the files stay `pending` and
    /// a throttled folder stays throttled for the next sweep.
    pub async fn retry_folder(&self, folder_id: &str) -> FetchResult<u64> {
        let folder = self.store.get_folder(folder_id).await?;

        let count = self.store.reset_for_retry(folder_id).await?;
        if count == 0 {
            debug!("nothing to retry in folder {}", folder_id);
            self.store.clear_folder_rate_limit(folder_id).await?;
            return Ok(0);
        }

        // Anything still queued for this folder is re-added below.
        self.scheduler.strip_folder(folder_id);

        let reference = FolderRef::new(folder.folder_id, folder.folder_key);
        match self.handles.reload(&reference).await {
            Ok(handle) => {
                self.store.clear_folder_rate_limit(folder_id).await?;
                let queued = self.requeue_pending(&handle).await?;
                info!(
                    "retrying folder {}: {} reset, {} queued",
                    folder_id, count, queued
                );
            }
            Err(err) if err.is_rate_limit() => {
                warn!(
                    "folder {} is still rate limited, will retry later: {}",
                    folder_id, err
                );
                self.store.set_folder_rate_limited(folder_id).await?;
            }
            Err(err) => {
                warn!(
                    "could not reopen folder {} for retry, files stay pending: {}",
                    folder_id, err
                );
            }
        }

        Ok(count)
    }

    /// Queue a job for every `pending` file of the folder that the handle
    /// still lists, then kick the scheduler. Returns how many were queued.
    pub async fn requeue_pending(&self, handle: &RemoteFolder) -> FetchResult<usize> {
        let folder_id = &handle.reference.folder_id;
        let pending = self
            .store
            .files_with_status(FileStatus::Pending, Some(folder_id))
            .await?;

        let listed: HashMap<&str, &RemoteFile> = handle
            .files
            .iter()
            .map(|f| (f.node_id.as_str(), f))
            .collect();

        let mut queued = 0;
        for record in pending {
            match listed.get(record.node_id.as_str()) {
                Some(file) => {
                    self.scheduler.enqueue(Job::new((*file).clone()));
                    queued += 1;
                }
                None => warn!(
                    "{}/{} ({}) is no longer listed by the remote folder; leaving it pending",
                    folder_id, record.node_id, record.name
                ),
            }
        }

        self.scheduler.drain();
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        state_store::RATE_LIMITED_ERROR,
        testing::{Behavior, folder_link, harness},
    };

    #[tokio::test]
    async fn load_persists_and_downloads_every_file() {
        let h = harness(2).await;
        h.fake.add_folder(
            "abc",
            "Holiday",
            &[("n1", "one.jpg", b"111"), ("n2", "two.jpg", b"2222")],
        );
        h.service.scheduler().start();

        let loaded = h.service.load_folder(&folder_link("abc")).await.unwrap();
        assert_eq!(loaded.folder_id, "abc");
        assert_eq!(loaded.name, "Holiday");
        assert_eq!(loaded.file_count, 2);

        h.service.scheduler().wait_idle().await;
        let detail = h.service.folder_detail("abc").await.unwrap();
        assert!(!detail.folder.downloading);
        assert!(detail
            .files
            .iter()
            .all(|f| f.status == FileStatus::Completed && f.error.is_none()));

        let opened = h.service.open_completed_file("abc", "n2").await.unwrap();
        assert_eq!(opened.len, 4);
        assert_eq!(opened.record.name, "two.jpg");
    }

    #[tokio::test]
    async fn loading_twice_conflicts_without_duplicating_rows() {
        let h = harness(1).await;
        h.fake.add_folder("abc", "A", &[("n1", "a", b"1")]);

        h.service.load_folder(&folder_link("abc")).await.unwrap();
        let err = h
            .service
            .load_folder(&folder_link("abc"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::AlreadyLoaded(id) if id == "abc"));
        assert_eq!(h.fake.load_calls(), 1);
        assert_eq!(h.service.folder_detail("abc").await.unwrap().files.len(), 1);
        assert_eq!(h.service.scheduler().queued_len(), 1);
    }

    #[tokio::test]
    async fn invalid_links_are_validation_errors() {
        let h = harness(1).await;
        for link in ["", "not a url", "https://remote.test/folder/abc"] {
            let err = h.service.load_folder(link).await.unwrap_err();
            assert!(matches!(err, FetchError::Validation(_)), "{link}");
        }
        assert_eq!(h.fake.load_calls(), 0);
    }

    #[tokio::test]
    async fn remote_failure_at_load_is_upstream_and_persists_nothing() {
        let h = harness(1).await;
        let err = h
            .service
            .load_folder(&folder_link("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Upstream(_)));
        assert!(h.service.list_folders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_folder_is_not_found_everywhere() {
        let h = harness(1).await;
        assert!(matches!(
            h.service.folder_detail("nope").await.unwrap_err(),
            FetchError::FolderNotFound(_)
        ));
        assert!(matches!(
            h.service.remove_folder("nope").await.unwrap_err(),
            FetchError::FolderNotFound(_)
        ));
        assert!(matches!(
            h.service.retry_folder("nope").await.unwrap_err(),
            FetchError::FolderNotFound(_)
        ));
        assert!(matches!(
            h.service.open_completed_file("nope", "n1").await.unwrap_err(),
            FetchError::FileNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn file_must_be_completed_and_on_disk_to_open() {
        let h = harness(1).await;
        h.fake.add_folder("abc", "A", &[("n1", "a.txt", b"1")]);
        h.service.load_folder(&folder_link("abc")).await.unwrap();

        let err = h
            .service
            .open_completed_file("abc", "n1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::NotReady {
                status: FileStatus::Pending,
                ..
            }
        ));

        h.service.scheduler().start();
        h.service.scheduler().wait_idle().await;
        std::fs::remove_file(h.downloads.path().join("abc").join("n1_a.txt")).unwrap();

        let err = h
            .service
            .open_completed_file("abc", "n1")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn retry_with_nothing_to_do_leaves_queue_alone() {
        let h = harness(1).await;
        h.fake.add_folder("abc", "A", &[("n1", "a", b"1")]);
        h.service.scheduler().start();
        h.service.load_folder(&folder_link("abc")).await.unwrap();
        h.service.scheduler().wait_idle().await;

        assert_eq!(h.service.retry_folder("abc").await.unwrap(), 0);
        assert_eq!(h.service.scheduler().queued_len(), 0);
        assert_eq!(h.service.scheduler().active_count(), 0);
        assert_eq!(h.fake.load_calls(), 1);
        assert_eq!(h.fake.opened(), vec!["abc/n1"]);
    }

    #[tokio::test]
    async fn retry_resets_failed_files_with_a_fresh_handle() {
        let h = harness(1).await;
        h.fake
            .add_folder("abc", "A", &[("n1", "a", b"1"), ("n2", "b", b"2")]);
        h.fake
            .set_behavior("abc", "n1", Behavior::Fail("boom".into()));
        h.service.scheduler().start();
        h.service.load_folder(&folder_link("abc")).await.unwrap();
        h.service.scheduler().wait_idle().await;

        let failed = h.service.store().get_file("abc", "n1").await.unwrap();
        assert_eq!(failed.status, FileStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());

        h.fake.clear_behavior("abc", "n1");
        assert_eq!(h.service.retry_folder("abc").await.unwrap(), 1);
        h.service.scheduler().wait_idle().await;

        let retried = h.service.store().get_file("abc", "n1").await.unwrap();
        assert_eq!(retried.status, FileStatus::Completed);
        assert!(retried.error.is_none());
        assert_eq!(h.fake.load_calls(), 2);
    }

    #[tokio::test]
    async fn retry_skips_files_the_remote_no_longer_lists() {
        let h = harness(1).await;
        h.fake
            .add_folder("abc", "A", &[("n1", "a", b"1"), ("n2", "b", b"2")]);
        h.fake
            .set_behavior("abc", "n1", Behavior::Fail("boom".into()));
        h.service.scheduler().start();
        h.service.load_folder(&folder_link("abc")).await.unwrap();
        h.service.scheduler().wait_idle().await;

        h.fake.remove_file("abc", "n1");
        assert_eq!(h.service.retry_folder("abc").await.unwrap(), 1);
        h.service.scheduler().wait_idle().await;

        let orphan = h.service.store().get_file("abc", "n1").await.unwrap();
        assert_eq!(orphan.status, FileStatus::Pending);
        assert_eq!(h.fake.opened(), vec!["abc/n1", "abc/n2"]);
    }

    #[tokio::test]
    async fn retry_while_remote_still_throttles_keeps_folder_rate_limited() {
        let h = harness(1).await;
        h.fake.add_folder("abc", "A", &[("n1", "a", b"1")]);
        h.fake.set_behavior("abc", "n1", Behavior::RateLimit);
        h.service.scheduler().start();
        h.service.load_folder(&folder_link("abc")).await.unwrap();
        h.service.scheduler().wait_idle().await;

        let file = h.service.store().get_file("abc", "n1").await.unwrap();
        assert_eq!(file.status, FileStatus::Pending);
        assert_eq!(file.error.as_deref(), Some(RATE_LIMITED_ERROR));

        h.fake.fail_loads("abc", true);
        assert_eq!(h.service.retry_folder("abc").await.unwrap(), 1);
        let folder = h.service.store().get_folder("abc").await.unwrap();
        assert!(folder.rate_limited);
        assert!(folder.rate_limited_at.is_some());
        assert_eq!(h.service.scheduler().queued_len(), 0);
    }

    #[tokio::test]
    async fn removing_folder_mid_transfer_does_not_resurrect_it() {
        let h = harness(1).await;
        h.fake
            .add_folder("abc", "A", &[("n1", "a", b"1"), ("n2", "b", b"2")]);
        let gate = h.fake.hold("abc", "n1");
        h.service.scheduler().start();
        h.service.load_folder(&folder_link("abc")).await.unwrap();
        crate::services::testing::eventually(|| h.fake.in_flight() == 1).await;

        h.service.remove_folder("abc").await.unwrap();
        let dir = h.downloads.path().join("abc");
        assert!(!dir.exists());
        assert!(h.service.list_folders().await.unwrap().is_empty());
        assert_eq!(h.service.scheduler().queued_len(), 0);

        gate.notify_one();
        h.service.scheduler().wait_idle().await;

        assert!(!dir.exists());
        assert!(h.service.store().find_folder("abc").await.unwrap().is_none());
        assert!(h.service.store().folder_files("abc").await.unwrap().is_empty());
        assert_eq!(h.fake.opened(), vec!["abc/n1"]);
    }
}
