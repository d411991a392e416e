//! Native surface of bucket/key object stores.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::ByteStream;

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    #[serde(default, rename = "ETag")]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a delimited listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<ObjectInfo>,
    /// Key prefixes rolled up at the delimiter, delimiter included.
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// Part acknowledged by the store during a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Errors reported by an object store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectApiError {
    /// Service answered with an error document.
    #[error("{code} ({status}): {message}")]
    Service {
        code: String,
        message: String,
        status: u16,
    },

    /// Request never got a response.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ObjectApiError {
    pub fn service(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        ObjectApiError::Service {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ObjectApiError::Service { code, .. } => Some(code),
            ObjectApiError::Transport(_) => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ObjectApiError::Service { status, .. } => Some(*status),
            ObjectApiError::Transport(_) => None,
        }
    }
}

pub type ObjectResult<T> = std::result::Result<T, ObjectApiError>;

/// Operations an object-store SDK exposes.
///
/// There are no folders: a "folder" is either a zero-length marker object
/// whose key ends with `/`, or implied by keys sharing its prefix.
#[async_trait]
pub trait ObjectApi: Send + Sync {
    /// Identity of the caller owning the access key.
    async fn caller_identity(&self) -> ObjectResult<String>;

    async fn head_bucket(&self, bucket: &str) -> ObjectResult<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> ObjectResult<ObjectInfo>;

    /// Keys starting with `prefix`, rolled up at `delimiter` when given.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> ObjectResult<ObjectListing>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        modified: Option<DateTime<Utc>>,
    ) -> ObjectResult<ObjectInfo>;

    async fn copy_object(&self, bucket: &str, from: &str, to: &str) -> ObjectResult<ObjectInfo>;

    /// Batch delete. Returns the keys the store failed to delete; absent
    /// keys count as deleted.
    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> ObjectResult<Vec<String>>;

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> ObjectResult<(ObjectInfo, ByteStream<ObjectApiError>)>;

    /// Open a multipart upload. Returns the upload ID.
    async fn create_multipart(&self, bucket: &str, key: &str) -> ObjectResult<String>;

    /// Store one part. Re-sending a part number replaces it.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ObjectResult<String>;

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        modified: Option<DateTime<Utc>>,
    ) -> ObjectResult<ObjectInfo>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> ObjectResult<()>;
}
