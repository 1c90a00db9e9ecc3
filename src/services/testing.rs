//! In-process doubles shared by the unit tests: a temporary state store and a
//! scriptable remote source.

use super::{
    fetch_service::FetchService,
    remote_source::{ByteStream, FolderRef, RemoteFile, RemoteFolder, RemoteSource, SourceError},
    scheduler::SchedulerConfig,
    state_store::{NewFile, StateStore},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Fresh migrated store in a temporary directory. Keep the `TempDir` alive.
pub async fn temp_store() -> (TempDir, StateStore) {
    let dir = tempfile::tempdir().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("state.db"))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .unwrap();
    let store = StateStore::new(Arc::new(pool));
    store.migrate().await.unwrap();
    (dir, store)
}

/// Persist an opened folder and its files as `pending`.
pub async fn seed_folder(store: &StateStore, folder: &RemoteFolder) {
    store
        .insert_folder(
            &folder.reference.folder_id,
            &folder.reference.folder_key,
            &folder.name,
        )
        .await
        .unwrap();
    let files: Vec<NewFile> = folder
        .files
        .iter()
        .map(|f| NewFile {
            node_id: f.node_id.clone(),
            name: f.name.clone(),
            size: f.size as i64,
            timestamp: f.timestamp,
        })
        .collect();
    store.insert_files(&folder.reference.folder_id, &files).await.unwrap();
}

/// Shareable link the fake source understands for `folder_id`.
pub fn folder_link(folder_id: &str) -> String {
    format!("https://remote.test/folder/{folder_id}#key-{folder_id}")
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// How the fake answers `open_stream` for one file.
#[derive(Clone)]
pub enum Behavior {
    Serve,
    Fail(String),
    RateLimit,
    Panic,
    /// Never finishes on its own.
    Stall,
    /// Waits for the notify before yielding its bytes.
    Held(Arc<Notify>),
}

struct FakeFolder {
    name: String,
    files: Vec<(String, String, Vec<u8>)>,
}

struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable `RemoteSource` that records how it was used.
#[derive(Default)]
pub struct FakeSource {
    folders: Mutex<HashMap<String, FakeFolder>>,
    behaviors: Mutex<HashMap<(String, String), Behavior>>,
    load_failures: Mutex<HashMap<String, bool>>,
    delay: Mutex<Duration>,
    opened: Mutex<Vec<String>>,
    load_calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_folder(&self, folder_id: &str, name: &str, files: &[(&str, &str, &[u8])]) {
        let files = files
            .iter()
            .map(|(node, name, data)| (node.to_string(), name.to_string(), data.to_vec()))
            .collect();
        self.folders.lock().unwrap().insert(
            folder_id.to_string(),
            FakeFolder {
                name: name.to_string(),
                files,
            },
        );
    }

    /// Drop a file from the remote listing.
    pub fn remove_file(&self, folder_id: &str, node_id: &str) {
        if let Some(folder) = self.folders.lock().unwrap().get_mut(folder_id) {
            folder.files.retain(|(node, _, _)| node != node_id);
        }
    }

    pub fn set_behavior(&self, folder_id: &str, node_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert((folder_id.to_string(), node_id.to_string()), behavior);
    }

    pub fn clear_behavior(&self, folder_id: &str, node_id: &str) {
        self.behaviors
            .lock()
            .unwrap()
            .remove(&(folder_id.to_string(), node_id.to_string()));
    }

    /// Hold the file's transfer open until the returned notify fires.
    pub fn hold(&self, folder_id: &str, node_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.set_behavior(folder_id, node_id, Behavior::Held(gate.clone()));
        gate
    }

    /// Make `load_folder` fail, with a throttling error when `rate_limited`.
    pub fn fail_loads(&self, folder_id: &str, rate_limited: bool) {
        self.load_failures
            .lock()
            .unwrap()
            .insert(folder_id.to_string(), rate_limited);
    }

    pub fn restore_loads(&self, folder_id: &str) {
        self.load_failures.lock().unwrap().remove(folder_id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// `folder/node` of every opened stream, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn load_folder(&self, folder: &FolderRef) -> Result<RemoteFolder, SourceError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .load_failures
            .lock()
            .unwrap()
            .get(&folder.folder_id)
            .copied();
        match failure {
            Some(true) => return Err(SourceError::RateLimited("listing throttled".into())),
            Some(false) => return Err(SourceError::Other("listing unavailable".into())),
            None => {}
        }

        let folders = self.folders.lock().unwrap();
        let fake = folders
            .get(&folder.folder_id)
            .ok_or_else(|| SourceError::FolderNotFound(folder.folder_id.clone()))?;
        Ok(RemoteFolder {
            reference: folder.clone(),
            name: fake.name.clone(),
            files: fake
                .files
                .iter()
                .map(|(node, name, data)| RemoteFile {
                    folder: folder.clone(),
                    node_id: node.clone(),
                    name: name.clone(),
                    size: data.len() as u64,
                    timestamp: Some(1_700_000_000),
                })
                .collect(),
        })
    }

    async fn open_stream(&self, file: &RemoteFile) -> Result<ByteStream, SourceError> {
        let key = (file.folder.folder_id.clone(), file.node_id.clone());
        self.opened
            .lock()
            .unwrap()
            .push(format!("{}/{}", key.0, key.1));

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Behavior::Serve);
        let data = self
            .folders
            .lock()
            .unwrap()
            .get(&key.0)
            .and_then(|f| f.files.iter().find(|(node, _, _)| *node == key.1))
            .map(|(_, _, data)| data.clone())
            .unwrap_or_default();
        let delay = *self.delay.lock().unwrap();

        let gate = match behavior {
            Behavior::Fail(message) => return Err(SourceError::Other(message)),
            Behavior::RateLimit => return Err(SourceError::RateLimited("quota exceeded".into())),
            Behavior::Panic => panic!("remote source exploded"),
            Behavior::Stall => Some(Arc::new(Notify::new())),
            Behavior::Held(gate) => Some(gate),
            Behavior::Serve => None,
        };

        let guard = InFlight::enter(self.in_flight.clone(), &self.peak);
        Ok(futures::stream::once(async move {
            let _guard = guard;
            if let Some(gate) = gate {
                gate.notified().await;
            }
            tokio::time::sleep(delay).await;
            Ok(Bytes::from(data))
        })
        .boxed())
    }
}

/// A `FetchService` over a temporary store and download root.
pub struct Harness {
    pub _db_dir: TempDir,
    pub downloads: TempDir,
    pub fake: Arc<FakeSource>,
    pub service: FetchService,
}

pub async fn harness(max_concurrent: usize) -> Harness {
    let (db_dir, store) = temp_store().await;
    let downloads = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeSource::new());
    let service = FetchService::new(
        store,
        fake.clone(),
        SchedulerConfig {
            max_concurrent,
            download_root: downloads.path().to_path_buf(),
            transfer_timeout: None,
        },
    );
    Harness {
        _db_dir: db_dir,
        downloads,
        fake,
        service,
    }
}
