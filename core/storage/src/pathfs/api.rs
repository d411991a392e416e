//! Native surface of path-addressed backends.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::ByteStream;

/// Metadata of one remote entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    /// Absolute remote path, `""` for the root.
    pub path: String,
    pub is_folder: bool,
    /// Content length; zero for folders.
    #[serde(default)]
    pub size: u64,
    /// Revision tag, changes on every content update.
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl PathEntry {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<PathEntry>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Conflict handling for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Fail with a conflict if the path is taken.
    Add,
    Overwrite,
}

/// Errors reported by a path-addressed backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathApiError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("conflict at {0}")]
    Conflict(String),

    #[error("invalid access token")]
    InvalidAccessToken,

    #[error("expired access token")]
    ExpiredAccessToken,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("incorrect offset, correct offset is {correct_offset}")]
    IncorrectOffset { correct_offset: u64 },

    #[error("rate limited")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

pub type PathResult<T> = std::result::Result<T, PathApiError>;

/// Operations a path-addressed SDK exposes.
///
/// Upload sessions take absolute offsets; a mismatching offset fails with
/// [`PathApiError::IncorrectOffset`] carrying the offset the server expects.
#[async_trait]
pub trait PathApi: Send + Sync {
    /// Display name of the authenticated account.
    async fn current_account(&self) -> PathResult<String>;

    async fn get_metadata(&self, path: &str) -> PathResult<PathEntry>;

    async fn list_folder(&self, path: &str, limit: usize) -> PathResult<ListPage>;

    async fn list_folder_continue(&self, cursor: &str) -> PathResult<ListPage>;

    /// Create a folder. The parent must exist.
    async fn create_folder(&self, path: &str) -> PathResult<PathEntry>;

    async fn move_entry(&self, from: &str, to: &str) -> PathResult<PathEntry>;

    /// Delete a file or a whole folder tree.
    async fn delete(&self, path: &str) -> PathResult<()>;

    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        mode: WriteMode,
        modified: Option<DateTime<Utc>>,
    ) -> PathResult<PathEntry>;

    /// Open an upload session, sending the first chunk. Returns the session id.
    async fn upload_session_start(&self, first: Bytes) -> PathResult<String>;

    async fn upload_session_append(&self, session: &str, offset: u64, data: Bytes) -> PathResult<()>;

    async fn upload_session_finish(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        path: &str,
        mode: WriteMode,
        modified: Option<DateTime<Utc>>,
    ) -> PathResult<PathEntry>;

    /// Metadata and content stream of a file.
    async fn download(&self, path: &str) -> PathResult<(PathEntry, ByteStream<PathApiError>)>;
}
