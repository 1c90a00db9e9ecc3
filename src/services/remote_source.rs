//! src/services/remote_source.rs
//!
//! The remote content source as seen by the orchestrator: load a folder
//! listing from a `FolderRef`, open a byte stream for one listed file.
//! `HttpFolderSource` is the production implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use reqwest::{Client, StatusCode, Url, header};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Substrings that identify a throttling failure when the source only
/// reports it as text.
const RATE_LIMIT_SIGNATURES: [&str; 5] = [
    "rate limit",
    "too many requests",
    "bandwidth limit",
    "eoverquota",
    "eagain",
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited by remote source: {0}")]
    RateLimited(String),
    #[error("remote folder `{0}` not found")]
    FolderNotFound(String),
    #[error("remote file `{node_id}` not found in folder `{folder_id}`")]
    FileNotFound { folder_id: String, node_id: String },
    #[error("remote responded with {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// True for the throttling failure class. Typed `RateLimited` errors
    /// always match; other variants match on the message signature.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            SourceError::RateLimited(_) => true,
            SourceError::Http { status, .. } if is_rate_limit_status(*status) => true,
            other => is_rate_limit_message(&other.to_string()),
        }
    }
}

pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

fn is_rate_limit_status(status: u16) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS.as_u16() || status == 509
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("folder url is not a valid url")]
    Malformed,
    #[error("folder url must contain a folder id and key")]
    MissingParts,
    #[error("folder id or key contains invalid characters")]
    InvalidToken,
}

/// Everything needed to (re)open a remote folder: the persisted id and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef {
    pub folder_id: String,
    pub folder_key: String,
}

impl FolderRef {
    pub fn new(folder_id: impl Into<String>, folder_key: impl Into<String>) -> Self {
        Self {
            folder_id: folder_id.into(),
            folder_key: folder_key.into(),
        }
    }

    /// Parse a shared folder link.
    ///
    /// Accepts `<scheme>://<host>/folder/<id>#<key>` and the legacy
    /// `<scheme>://<host>/#F!<id>!<key>` form.
    pub fn from_link(link: &str) -> Result<Self, LinkError> {
        let url = Url::parse(link.trim()).map_err(|_| LinkError::Malformed)?;
        if url.host_str().is_none() {
            return Err(LinkError::Malformed);
        }
        let fragment = url.fragment().unwrap_or_default();

        let (id, key) = if let Some(legacy) = fragment.strip_prefix("F!") {
            let mut parts = legacy.splitn(2, '!');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        } else {
            let segments: Vec<&str> = url
                .path_segments()
                .map(|s| s.filter(|seg| !seg.is_empty()).collect())
                .unwrap_or_default();
            match segments.as_slice() {
                [.., "folder", id] => (id.to_string(), fragment.to_string()),
                _ => return Err(LinkError::MissingParts),
            }
        };

        if id.is_empty() || key.is_empty() {
            return Err(LinkError::MissingParts);
        }
        if !is_token(&id) || !is_token(&key) {
            return Err(LinkError::InvalidToken);
        }
        Ok(Self::new(id, key))
    }
}

fn is_token(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// One file entry of an opened remote folder. Self-sufficient for
/// `RemoteSource::open_stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub folder: FolderRef,
    pub node_id: String,
    pub name: String,
    pub size: u64,
    pub timestamp: Option<i64>,
}

/// An opened remote folder: its display name and file listing.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub reference: FolderRef,
    pub name: String,
    pub files: Vec<RemoteFile>,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, SourceError>>;

/// External content capability.
#[async_trait]
pub trait RemoteSource: Send + Sync + 'static {
    /// Open a folder and enumerate its files.
    async fn load_folder(&self, folder: &FolderRef) -> Result<RemoteFolder, SourceError>;

    /// Open a byte stream for a single listed file.
    async fn open_stream(&self, file: &RemoteFile) -> Result<ByteStream, SourceError>;
}

#[derive(Debug, Deserialize)]
struct Listing {
    name: Option<String>,
    #[serde(default)]
    files: Vec<ListingEntry>,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    timestamp: Option<i64>,
}

/// Remote source speaking a JSON listing protocol over HTTP.
///
/// - `GET {base}/folder/{id}` with `Authorization: Bearer {key}` returns
///   `{name, files: [{id, name, size, timestamp}]}`
/// - `GET {base}/folder/{id}/file/{node}` returns the file bytes
#[derive(Clone)]
pub struct HttpFolderSource {
    http: Client,
    base_url: Url,
}

impl HttpFolderSource {
    pub fn new(base_url: &str) -> Result<Self, SourceError> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> Result<Self, SourceError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| SourceError::Other(format!("invalid remote base url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::Other(format!(
                "remote base url `{base_url}` cannot be a base"
            )));
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `not_found` builds the error for a 404, which means a missing folder
    /// on the listing endpoint and a missing file on the stream endpoint.
    async fn get(
        &self,
        url: Url,
        folder: &FolderRef,
        not_found: impl FnOnce() -> SourceError,
    ) -> Result<reqwest::Response, SourceError> {
        debug!("GET {}", url);
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", folder.folder_key))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if is_rate_limit_status(status.as_u16()) {
            return Err(SourceError::RateLimited(format!("{status} {message}")));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(not_found());
        }
        Err(SourceError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteSource for HttpFolderSource {
    async fn load_folder(&self, folder: &FolderRef) -> Result<RemoteFolder, SourceError> {
        let url = self.endpoint(&["folder", &folder.folder_id]);
        let listing: Listing = self
            .get(url, folder, || SourceError::FolderNotFound(folder.folder_id.clone()))
            .await?
            .json()
            .await?;

        let files = listing
            .files
            .into_iter()
            .map(|entry| RemoteFile {
                folder: folder.clone(),
                node_id: entry.id,
                name: entry.name,
                size: entry.size,
                timestamp: entry.timestamp,
            })
            .collect();

        Ok(RemoteFolder {
            reference: folder.clone(),
            name: listing
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| folder.folder_id.clone()),
            files,
        })
    }

    async fn open_stream(&self, file: &RemoteFile) -> Result<ByteStream, SourceError> {
        let url = self.endpoint(&["folder", &file.folder.folder_id, "file", &file.node_id]);
        let response = self
            .get(url, &file.folder, || SourceError::FileNotFound {
                folder_id: file.folder.folder_id.clone(),
                node_id: file.node_id.clone(),
            })
            .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(SourceError::from))
            .boxed())
    }
}
