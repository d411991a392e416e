//! Native surface of ID-addressed backends.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::ByteStream;

/// Remote item metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdItem {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    /// Content length (files only).
    #[serde(default)]
    pub size: Option<u64>,
    /// Containing folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Change tag, new on every content update.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
}

/// One page of children.
#[derive(Debug, Clone, Default)]
pub struct ItemPage {
    pub items: Vec<IdItem>,
    pub next_page_token: Option<String>,
}

/// Server answer to a resumable upload range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeAck {
    /// Server holds the first `received` bytes and wants more.
    Incomplete { received: u64 },
    Complete(IdItem),
}

/// Errors reported by an ID-addressed backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdApiError {
    /// Non-success HTTP status with the optional machine-readable reason.
    #[error("HTTP {status}{}: {message}", .reason.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default())]
    Http {
        status: u16,
        reason: Option<String>,
        message: String,
    },

    /// Request never got a response.
    #[error("transport error: {0}")]
    Transport(String),
}

impl IdApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        IdApiError::Http {
            status,
            reason: None,
            message: message.into(),
        }
    }

    pub fn with_reason(status: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        IdApiError::Http {
            status,
            reason: Some(reason.into()),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            IdApiError::Http { status, .. } => Some(*status),
            IdApiError::Transport(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            IdApiError::Http { reason, .. } => reason.as_deref(),
            IdApiError::Transport(_) => None,
        }
    }
}

pub type IdResult<T> = std::result::Result<T, IdApiError>;

/// Operations an ID-addressed SDK exposes.
///
/// Items are addressed by opaque IDs; names are only unique within a folder
/// by convention, and `find_child` returns the first match.
#[async_trait]
pub trait IdApi: Send + Sync {
    /// Account label of the authenticated user.
    async fn about(&self) -> IdResult<String>;

    async fn root_id(&self) -> IdResult<String>;

    async fn get_item(&self, id: &str) -> IdResult<IdItem>;

    async fn find_child(&self, parent_id: &str, name: &str) -> IdResult<Option<IdItem>>;

    async fn list_children(
        &self,
        parent_id: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> IdResult<ItemPage>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> IdResult<IdItem>;

    /// Re-parent and/or rename an item.
    async fn move_item(
        &self,
        id: &str,
        from_parent: &str,
        to_parent: &str,
        new_name: &str,
    ) -> IdResult<IdItem>;

    /// Delete an item; folders are deleted with their content.
    async fn delete_item(&self, id: &str) -> IdResult<()>;

    /// Single-request upload. `existing_id` replaces that item's content.
    async fn upload_simple(
        &self,
        parent_id: &str,
        name: &str,
        existing_id: Option<&str>,
        data: Bytes,
        modified: Option<DateTime<Utc>>,
    ) -> IdResult<IdItem>;

    /// Open a resumable upload. Returns the session URL.
    async fn start_resumable(
        &self,
        parent_id: &str,
        name: &str,
        existing_id: Option<&str>,
        total: u64,
        modified: Option<DateTime<Utc>>,
    ) -> IdResult<String>;

    async fn upload_range(&self, url: &str, offset: u64, data: Bytes, total: u64) -> IdResult<RangeAck>;

    /// Ask how much of a resumable upload the server holds.
    async fn query_upload(&self, url: &str, total: u64) -> IdResult<RangeAck>;

    async fn download_range(&self, id: &str, offset: u64, len: u64) -> IdResult<Bytes>;

    async fn download(&self, id: &str) -> IdResult<ByteStream<IdApiError>>;
}
