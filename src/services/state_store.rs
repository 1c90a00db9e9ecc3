//! src/services/state_store.rs
//!
//! StateStore: durable record of every loaded folder and its files, backed by
//! SQLite. It is the only state trusted after a restart. Every mutation is a
//! single auto-committed statement; only migrations run inside a transaction.

use crate::models::{
    file::{FileRecord, FileStatus},
    folder::{Folder, FolderSummary},
};
use chrono::Utc;
use sqlx::{SqlitePool, migrate::Migrator};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Error stored for files that the remote source throttled.
pub const RATE_LIMITED_ERROR: &str = "Rate limited";

const FOLDER_COLUMNS: &str =
    "folder_id, folder_key, name, loaded_at, downloading, rate_limited, rate_limited_at";

const FILE_COLUMNS: &str =
    "folder_id, node_id, name, size, timestamp, status, error, started_at, completed_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("folder `{0}` not found")]
    FolderNotFound(String),
    #[error("folder `{0}` already exists")]
    FolderExists(String),
    #[error("file `{node_id}` not found in folder `{folder_id}`")]
    FileNotFound { folder_id: String, node_id: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A file discovered in a remote listing, ready to be inserted as `pending`.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub node_id: String,
    pub name: String,
    pub size: i64,
    pub timestamp: Option<i64>,
}

#[derive(Clone)]
pub struct StateStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl StateStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&*self.db).await?;
        Ok(())
    }

    /// Insert a new folder row.
    ///
    /// The primary key is the uniqueness check; a duplicate returns
    /// `FolderExists` rather than a separate check-then-insert.
    pub async fn insert_folder(
        &self,
        folder_id: &str,
        folder_key: &str,
        name: &str,
    ) -> StoreResult<Folder> {
        let folder = Folder {
            folder_id: folder_id.to_string(),
            folder_key: folder_key.to_string(),
            name: name.to_string(),
            loaded_at: Utc::now(),
            downloading: false,
            rate_limited: false,
            rate_limited_at: None,
        };

        match sqlx::query(
            "INSERT INTO folders (folder_id, folder_key, name, loaded_at, downloading, rate_limited)
             VALUES (?, ?, ?, ?, 0, 0)",
        )
        .bind(&folder.folder_id)
        .bind(&folder.folder_key)
        .bind(&folder.name)
        .bind(folder.loaded_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(folder),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::FolderExists(folder_id.to_string()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Insert discovered files as `pending`. Duplicate node ids in a listing
    /// are ignored. Returns the number of rows inserted.
    pub async fn insert_files(&self, folder_id: &str, files: &[NewFile]) -> StoreResult<u64> {
        let mut inserted = 0;
        for file in files {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO files (folder_id, node_id, name, size, timestamp, status)
                 VALUES (?, ?, ?, ?, ?, 'pending')",
            )
            .bind(folder_id)
            .bind(&file.node_id)
            .bind(&file.name)
            .bind(file.size.max(0))
            .bind(file.timestamp)
            .execute(&*self.db)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn get_folder(&self, folder_id: &str) -> StoreResult<Folder> {
        self.find_folder(folder_id)
            .await?
            .ok_or_else(|| StoreError::FolderNotFound(folder_id.to_string()))
    }

    pub async fn find_folder(&self, folder_id: &str) -> StoreResult<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE folder_id = ?"
        ))
        .bind(folder_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(folder)
    }

    /// Every folder with its per-status file counts, oldest first.
    pub async fn list_folder_summaries(&self) -> StoreResult<Vec<FolderSummary>> {
        let rows = sqlx::query_as::<_, FolderSummary>(
            "SELECT f.folder_id, f.folder_key, f.name, f.loaded_at, f.downloading,
                    f.rate_limited, f.rate_limited_at,
                    COUNT(fi.node_id) AS total_files,
                    COALESCE(SUM(fi.status = 'completed'), 0) AS completed_files,
                    COALESCE(SUM(fi.status = 'downloading'), 0) AS downloading_files,
                    COALESCE(SUM(fi.status = 'pending'), 0) AS pending_files,
                    COALESCE(SUM(fi.status = 'failed'), 0) AS failed_files
             FROM folders f
             LEFT JOIN files fi ON fi.folder_id = f.folder_id
             GROUP BY f.folder_id
             ORDER BY f.loaded_at ASC, f.folder_id ASC",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// All files of a folder, in node id order.
    pub async fn folder_files(&self, folder_id: &str) -> StoreResult<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE folder_id = ? ORDER BY node_id ASC"
        ))
        .bind(folder_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    pub async fn get_file(&self, folder_id: &str, node_id: &str) -> StoreResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE folder_id = ? AND node_id = ?"
        ))
        .bind(folder_id)
        .bind(node_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StoreError::FileNotFound {
            folder_id: folder_id.to_string(),
            node_id: node_id.to_string(),
        })
    }

    /// Files in `status`, optionally scoped to one folder.
    pub async fn files_with_status(
        &self,
        status: FileStatus,
        folder_id: Option<&str>,
    ) -> StoreResult<Vec<FileRecord>> {
        let rows = match folder_id {
            Some(folder_id) => {
                sqlx::query_as::<_, FileRecord>(&format!(
                    "SELECT {FILE_COLUMNS} FROM files
                     WHERE status = ? AND folder_id = ? ORDER BY node_id ASC"
                ))
                .bind(status.as_str())
                .bind(folder_id)
                .fetch_all(&*self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, FileRecord>(&format!(
                    "SELECT {FILE_COLUMNS} FROM files
                     WHERE status = ? ORDER BY folder_id ASC, node_id ASC"
                ))
                .bind(status.as_str())
                .fetch_all(&*self.db)
                .await?
            }
        };
        Ok(rows)
    }

    /// Distinct folders that currently own at least one `pending` file.
    pub async fn folders_with_pending_files(&self) -> StoreResult<Vec<Folder>> {
        let rows = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders
             WHERE folder_id IN (SELECT DISTINCT folder_id FROM files WHERE status = 'pending')
             ORDER BY loaded_at ASC, folder_id ASC"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    pub async fn rate_limited_folders(&self) -> StoreResult<Vec<Folder>> {
        let rows = sqlx::query_as::<_, Folder>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE rate_limited = 1
             ORDER BY rate_limited_at ASC, folder_id ASC"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Delete a folder; its files go with it through the cascade.
    pub async fn delete_folder(&self, folder_id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM folders WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FolderNotFound(folder_id.to_string()));
        }
        Ok(())
    }

    /// `pending -> downloading`. Returns false when the row is gone or no
    /// longer pending, in which case the job must not run.
    pub async fn mark_downloading(&self, folder_id: &str, node_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'downloading', started_at = ?, completed_at = NULL, error = NULL
             WHERE folder_id = ? AND node_id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(folder_id)
        .bind(node_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE folders SET downloading = 1 WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&*self.db)
            .await?;
        Ok(true)
    }

    /// `downloading -> completed`. Returns false if the row vanished or was
    /// reset meanwhile.
    pub async fn mark_completed(&self, folder_id: &str, node_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'completed', completed_at = ?, error = NULL
             WHERE folder_id = ? AND node_id = ? AND status = 'downloading'",
        )
        .bind(Utc::now())
        .bind(folder_id)
        .bind(node_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `downloading -> failed`.
    pub async fn mark_failed(&self, folder_id: &str, node_id: &str, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET status = 'failed', completed_at = ?, error = ?
             WHERE folder_id = ? AND node_id = ? AND status = 'downloading'",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(folder_id)
        .bind(node_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `downloading -> pending` after a throttled transfer, and flag the
    /// folder as rate limited.
    pub async fn mark_rate_limited(&self, folder_id: &str, node_id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE files SET status = 'pending', error = ?, started_at = NULL, completed_at = NULL
             WHERE folder_id = ? AND node_id = ? AND status = 'downloading'",
        )
        .bind(RATE_LIMITED_ERROR)
        .bind(folder_id)
        .bind(node_id)
        .execute(&*self.db)
        .await?;

        self.set_folder_rate_limited(folder_id).await
    }

    /// Flag a folder as throttled. The first timestamp is kept if it is
    /// already flagged.
    pub async fn set_folder_rate_limited(&self, folder_id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE folders SET rate_limited = 1, rate_limited_at = COALESCE(rate_limited_at, ?)
             WHERE folder_id = ?",
        )
        .bind(Utc::now())
        .bind(folder_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn clear_folder_rate_limit(&self, folder_id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE folders SET rate_limited = 0, rate_limited_at = NULL WHERE folder_id = ?",
        )
        .bind(folder_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Reset a folder's `failed` and `pending` files to a clean `pending`.
    /// Returns how many rows were reset.
    pub async fn reset_for_retry(&self, folder_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', error = NULL, started_at = NULL, completed_at = NULL
             WHERE folder_id = ? AND status IN ('failed', 'pending')",
        )
        .bind(folder_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Reset every `downloading` row to `pending`. Only valid at startup, when
    /// no transfer can be in flight.
    pub async fn reset_orphaned_downloads(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', started_at = NULL WHERE status = 'downloading'",
        )
        .execute(&*self.db)
        .await?;

        sqlx::query("UPDATE folders SET downloading = 0 WHERE downloading = 1")
            .execute(&*self.db)
            .await?;

        debug!("reset {} orphaned downloads", result.rows_affected());
        Ok(result.rows_affected())
    }

    /// Recompute and persist whether the folder still has a file in
    /// `downloading`. Returns the new flag, false if the folder is gone.
    ///
    /// One statement, so a concurrent `mark_downloading` on the same folder
    /// cannot be overwritten by a stale read.
    pub async fn refresh_folder_downloading_status(&self, folder_id: &str) -> StoreResult<bool> {
        let downloading: Option<bool> = sqlx::query_scalar(
            "UPDATE folders
             SET downloading = EXISTS(
                 SELECT 1 FROM files WHERE files.folder_id = ?1 AND files.status = 'downloading'
             )
             WHERE folder_id = ?1
             RETURNING downloading",
        )
        .bind(folder_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(downloading.unwrap_or(false))
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation()
            || db_err.message().to_ascii_lowercase().contains("unique")
    )
}
