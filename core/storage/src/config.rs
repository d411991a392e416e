//! Tunables shared by every adapter.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage layer configuration.
///
/// Deserializes from JSON with every field optional; missing fields take the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Files larger than this are uploaded through a resumable session.
    pub chunk_threshold: u64,
    /// Size of each chunk sent or fetched by the transfer engine.
    pub chunk_size: usize,
    /// Total attempts a chunked transfer may make before giving up.
    pub max_attempts: u32,
    /// Backoff unit in milliseconds; attempt `n` waits `step * n²`.
    pub backoff_step_ms: u64,
    /// Maximum number of path→id entries kept per adapter.
    pub resolution_cache_capacity: u64,
    /// Directory holding one content cache store per backend kind.
    /// Content caching is disabled when unset.
    pub content_cache_dir: Option<PathBuf>,
    /// Byte capacity of each content cache store.
    pub content_cache_capacity: u64,
    /// Page size requested from listing calls.
    pub page_size: usize,
}

impl StorageConfig {
    /// Set the chunking threshold.
    pub fn with_chunk_threshold(mut self, threshold: u64) -> Self {
        self.chunk_threshold = threshold;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Set the attempt budget for chunked transfers.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the backoff unit.
    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step_ms = step.as_millis() as u64;
        self
    }

    /// Set the resolution cache capacity.
    pub fn with_resolution_cache_capacity(mut self, capacity: u64) -> Self {
        self.resolution_cache_capacity = capacity;
        self
    }

    /// Enable the content cache under `dir`.
    pub fn with_content_cache(mut self, dir: impl Into<PathBuf>, capacity: u64) -> Self {
        self.content_cache_dir = Some(dir.into());
        self.content_cache_capacity = capacity;
        self
    }

    /// Set the listing page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 8 * 1024 * 1024,
            chunk_size: 4 * 1024 * 1024,
            max_attempts: 5,
            backoff_step_ms: 200,
            resolution_cache_capacity: 1000,
            content_cache_dir: None,
            content_cache_capacity: 256 * 1024 * 1024,
            page_size: 1000,
        }
    }
}
