//! src/services/scheduler.rs
//!
//! Scheduler: bounded worker pool over an in-memory FIFO job queue.
//!
//! `drain()` starts queued jobs while fewer than `max_concurrent` transfers
//! are active; each finished transfer calls `drain()` again, so the ceiling
//! stays saturated without a polling loop. Every outcome is recorded in the
//! `StateStore` before the slot is released.

use super::{
    remote_source::{RemoteFile, RemoteSource, SourceError},
    state_store::StateStore,
};
use futures::{FutureExt, StreamExt};
use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Notify,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One file transfer waiting for a worker slot.
#[derive(Debug, Clone)]
pub struct Job {
    pub folder_id: String,
    pub node_id: String,
    pub file: RemoteFile,
    pub name: String,
    pub size: u64,
}

impl Job {
    pub fn new(file: RemoteFile) -> Self {
        Self {
            folder_id: file.folder.folder_id.clone(),
            node_id: file.node_id.clone(),
            name: file.name.clone(),
            size: file.size,
            file,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Transfer timed out")]
    TimedOut,
    #[error("transfer panicked")]
    Panicked,
}

impl TransferError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TransferError::Source(err) if err.is_rate_limit())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global ceiling on concurrent transfers (at least 1).
    pub max_concurrent: usize,
    /// Root under which `<folder_id>/<node_id>_<name>` files are written.
    pub download_root: PathBuf,
    /// Abort transfers that run longer than this. `None` disables the limit.
    pub transfer_timeout: Option<Duration>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Job>,
    active: usize,
    started: bool,
    closed: bool,
}

pub struct Scheduler {
    store: StateStore,
    source: Arc<dyn RemoteSource>,
    config: SchedulerConfig,
    state: Mutex<QueueState>,
    idle: Notify,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Create a scheduler. Jobs may be enqueued right away but nothing runs
    /// until `start()` is called.
    pub fn new(
        store: StateStore,
        source: Arc<dyn RemoteSource>,
        mut config: SchedulerConfig,
    ) -> Arc<Self> {
        config.max_concurrent = config.max_concurrent.max(1);
        Arc::new(Self {
            store,
            source,
            config,
            state: Mutex::new(QueueState::default()),
            idle: Notify::new(),
            tracker: TaskTracker::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory holding a folder's downloaded files.
    pub fn folder_dir(&self, folder_id: &str) -> PathBuf {
        self.config.download_root.join(safe_component(folder_id))
    }

    /// Final on-disk location of a file: `<root>/<folder_id>/<node_id>_<name>`.
    pub fn file_path(&self, folder_id: &str, node_id: &str, name: &str) -> PathBuf {
        self.folder_dir(folder_id).join(format!(
            "{}_{}",
            safe_component(node_id),
            safe_component(name)
        ))
    }

    /// Append a job to the tail of the queue.
    pub fn enqueue(&self, job: Job) {
        debug!("queued {}/{} ({})", job.folder_id, job.node_id, job.name);
        self.lock().queue.push_back(job);
    }

    /// Remove every not-yet-started job of a folder. Returns how many were
    /// removed.
    pub fn strip_folder(&self, folder_id: &str) -> usize {
        let mut state = self.lock();
        let before = state.queue.len();
        state.queue.retain(|job| job.folder_id != folder_id);
        before - state.queue.len()
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// `(folder_id, node_id)` of every queued job, head first.
    pub fn queued_jobs(&self) -> Vec<(String, String)> {
        self.lock()
            .queue
            .iter()
            .map(|job| (job.folder_id.clone(), job.node_id.clone()))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.active == 0 && state.queue.is_empty()
    }

    /// Allow jobs to run and fill the available slots.
    pub fn start(self: &Arc<Self>) {
        self.lock().started = true;
        info!(
            "scheduler started (max_concurrent={}, queued={})",
            self.config.max_concurrent,
            self.queued_len()
        );
        self.drain();
    }

    /// Start queued jobs until the ceiling is reached or the queue is empty.
    /// Safe to call at any time and any number of times.
    pub fn drain(self: &Arc<Self>) {
        loop {
            let job = {
                let mut state = self.lock();
                if !state.started || state.closed || state.active >= self.config.max_concurrent {
                    return;
                }
                match state.queue.pop_front() {
                    Some(job) => {
                        state.active += 1;
                        job
                    }
                    None => return,
                }
            };

            let scheduler = Arc::clone(self);
            self.tracker.spawn(async move {
                scheduler.run_job(job).await;
                scheduler.release_slot();
                scheduler.drain();
            });
        }
    }

    fn release_slot(&self) {
        let now_idle = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            state.active == 0 && (state.queue.is_empty() || state.closed)
        };
        if now_idle {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once no job is active or queued.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop starting new jobs and wait up to `grace` for in-flight transfers.
    /// Returns true if every transfer finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let (active, queued) = {
            let mut state = self.lock();
            state.closed = true;
            (state.active, state.queue.len())
        };
        info!(
            "scheduler shutting down ({} in flight, {} queued left for next start)",
            active, queued
        );
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }

    /// Execute one job and record its outcome. Never panics outward.
    async fn run_job(&self, job: Job) {
        match self.store.mark_downloading(&job.folder_id, &job.node_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "skipping {}/{}: no longer pending",
                    job.folder_id, job.node_id
                );
                return;
            }
            Err(err) => {
                error!(
                    "could not claim {}/{}: {}",
                    job.folder_id, job.node_id, err
                );
                return;
            }
        }

        debug!("downloading {}/{} ({} bytes)", job.folder_id, job.node_id, job.size);
        let outcome = self.transfer(&job).await;

        match outcome {
            Ok(written) => match self.store.mark_completed(&job.folder_id, &job.node_id).await {
                Ok(true) => info!(
                    "completed {}/{} ({}, {} bytes)",
                    job.folder_id, job.node_id, job.name, written
                ),
                Ok(false) => self.discard_orphan(&job).await,
                Err(err) => error!(
                    "could not record completion of {}/{}: {}",
                    job.folder_id, job.node_id, err
                ),
            },
            Err(err) if err.is_rate_limit() => {
                warn!(
                    "rate limited while downloading {}/{}: {}",
                    job.folder_id, job.node_id, err
                );
                if let Err(store_err) = self
                    .store
                    .mark_rate_limited(&job.folder_id, &job.node_id)
                    .await
                {
                    error!(
                        "could not record rate limit for {}/{}: {}",
                        job.folder_id, job.node_id, store_err
                    );
                }
                let paused = self.strip_folder(&job.folder_id);
                if paused > 0 {
                    info!(
                        "paused {} queued jobs of rate limited folder {}",
                        paused, job.folder_id
                    );
                }
            }
            Err(err) => {
                warn!("failed {}/{}: {}", job.folder_id, job.node_id, err);
                if let Err(store_err) = self
                    .store
                    .mark_failed(&job.folder_id, &job.node_id, &err.to_string())
                    .await
                {
                    error!(
                        "could not record failure of {}/{}: {}",
                        job.folder_id, job.node_id, store_err
                    );
                }
            }
        }

        if let Err(err) = self
            .store
            .refresh_folder_downloading_status(&job.folder_id)
            .await
        {
            error!(
                "could not refresh downloading flag of {}: {}",
                job.folder_id, err
            );
        }
    }

    /// Stream a job's bytes into a temporary file and rename it into place.
    ///
    /// Panics and timeouts inside the copy are converted into errors and the
    /// temporary file is removed on every failure path.
    async fn transfer(&self, job: &Job) -> Result<u64, TransferError> {
        let target = self.file_path(&job.folder_id, &job.node_id, &job.name);
        let parent = self.folder_dir(&job.folder_id);
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let copy = AssertUnwindSafe(self.copy_stream(&job.file, &tmp_path)).catch_unwind();
        let result = match self.config.transfer_timeout {
            Some(limit) => match tokio::time::timeout(limit, copy).await {
                Ok(caught) => caught.unwrap_or(Err(TransferError::Panicked)),
                Err(_) => Err(TransferError::TimedOut),
            },
            None => copy.await.unwrap_or(Err(TransferError::Panicked)),
        };

        let written = match result {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&target).await?;
                fs::rename(&tmp_path, &target).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(TransferError::Io(err));
            }
        }

        if written != job.size {
            debug!(
                "{}/{}: wrote {} bytes, listing reported {}",
                job.folder_id, job.node_id, written, job.size
            );
        }
        Ok(written)
    }

    async fn copy_stream(&self, file: &RemoteFile, tmp_path: &Path) -> Result<u64, TransferError> {
        let mut stream = self.source.open_stream(file).await?;
        let mut out = File::create(tmp_path).await?;

        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(written)
    }

    /// The folder was removed while this job was in flight: drop the file it
    /// just wrote instead of leaving it behind.
    async fn discard_orphan(&self, job: &Job) {
        match self.store.find_folder(&job.folder_id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                debug!(
                    "{}/{} was reset during transfer; keeping row as is",
                    job.folder_id, job.node_id
                );
                return;
            }
            Err(err) => {
                error!("could not look up folder {}: {}", job.folder_id, err);
                return;
            }
        }

        debug!(
            "folder {} was removed during transfer of {}; discarding file",
            job.folder_id, job.node_id
        );
        let target = self.file_path(&job.folder_id, &job.node_id, &job.name);
        if let Err(err) = fs::remove_file(&target).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("could not remove orphaned {}: {}", target.display(), err);
            }
        }
        // Only succeeds when the directory is empty.
        let _ = fs::remove_dir(self.folder_dir(&job.folder_id)).await;
    }
}

/// Make a remote name safe to use as a single path component.
pub fn safe_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
