//! Represents a remote folder tracked as one unit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::file::FileRecord;

/// A folder loaded from the remote source.
///
/// The `folder_key` is needed to re-open the remote handle after a restart and
/// is never serialized to API clients.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    /// Opaque identifier assigned by the remote source (primary key).
    pub folder_id: String,

    /// Secret key required to open the remote folder.
    #[serde(skip_serializing)]
    pub folder_key: String,

    /// Display name; falls back to the identifier when the remote omits it.
    pub name: String,

    /// When the folder was first loaded.
    pub loaded_at: DateTime<Utc>,

    /// True while at least one of its files is `downloading`.
    pub downloading: bool,

    /// Set when the remote source throttled one of this folder's transfers.
    pub rate_limited: bool,

    /// Non-null iff `rate_limited` is true.
    pub rate_limited_at: Option<DateTime<Utc>>,
}

/// Per-status file counts for one folder.
#[derive(Serialize, Clone, FromRow, Debug, Default, PartialEq, Eq)]
pub struct FileCounts {
    #[sqlx(rename = "total_files")]
    pub total: i64,
    #[sqlx(rename = "completed_files")]
    pub completed: i64,
    #[sqlx(rename = "downloading_files")]
    pub downloading: i64,
    #[sqlx(rename = "pending_files")]
    pub pending: i64,
    #[sqlx(rename = "failed_files")]
    pub failed: i64,
}

/// Row returned by `GET /folder`.
#[derive(Serialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FolderSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub folder: Folder,

    #[sqlx(flatten)]
    pub files: FileCounts,
}

/// Body returned by `GET /folder/{folder_id}`.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FolderDetail {
    #[serde(flatten)]
    pub folder: Folder,

    pub files: Vec<FileRecord>,
}
