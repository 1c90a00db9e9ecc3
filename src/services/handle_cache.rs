//! Process-local cache of opened remote folders.
//!
//! Handles cannot be persisted, so the cache starts empty on every run and is
//! filled lazily from the persisted folder id and key.

use super::remote_source::{FolderRef, RemoteFolder, RemoteSource, SourceError};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

pub struct FolderHandleCache {
    source: Arc<dyn RemoteSource>,
    handles: Mutex<HashMap<String, Arc<RemoteFolder>>>,
}

impl FolderHandleCache {
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self {
            source,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RemoteFolder>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, folder_id: &str) -> Option<Arc<RemoteFolder>> {
        self.lock().get(folder_id).cloned()
    }

    pub fn insert(&self, folder: RemoteFolder) -> Arc<RemoteFolder> {
        let folder = Arc::new(folder);
        self.lock()
            .insert(folder.reference.folder_id.clone(), Arc::clone(&folder));
        folder
    }

    pub fn evict(&self, folder_id: &str) {
        self.lock().remove(folder_id);
    }

    /// Return the cached handle, opening the folder when it is missing.
    pub async fn get_or_open(&self, folder: &FolderRef) -> Result<Arc<RemoteFolder>, SourceError> {
        if let Some(handle) = self.get(&folder.folder_id) {
            return Ok(handle);
        }
        self.reload(folder).await
    }

    /// Open the folder again and replace any cached handle, so the listing
    /// reflects the current remote state.
    pub async fn reload(&self, folder: &FolderRef) -> Result<Arc<RemoteFolder>, SourceError> {
        debug!("opening remote folder {}", folder.folder_id);
        let opened = self.source.load_folder(folder).await?;
        Ok(self.insert(opened))
    }
}
