//! Represents a single file of a tracked folder and its transfer status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::fmt;
use thiserror::Error;

/// Transfer status of a file.
///
/// `pending -> downloading -> completed | failed`. `failed` and `pending` can
/// be re-entered through a retry, and `downloading` falls back to `pending`
/// when a throttled transfer or a crash interrupts it.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
#[error("unknown file status `{0}`")]
pub struct UnknownStatus(pub String);

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Downloading => "downloading",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for FileStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(FileStatus::Pending),
            "downloading" => Ok(FileStatus::Downloading),
            "completed" => Ok(FileStatus::Completed),
            "failed" => Ok(FileStatus::Failed),
            _ => Err(UnknownStatus(value)),
        }
    }
}

/// Persisted record of one remote file.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Owning folder.
    #[serde(skip_serializing)]
    pub folder_id: String,

    /// Stable identifier assigned by the remote source.
    pub node_id: String,

    pub name: String,

    /// Size in bytes as reported by the remote listing.
    pub size: i64,

    /// Remote modification time (unix seconds), when known.
    pub timestamp: Option<i64>,

    #[sqlx(try_from = "String")]
    pub status: FileStatus,

    /// Last failure message; always set for `failed`, null for `completed`.
    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,
}
