//! Resumable transfer engine.
//!
//! Large uploads run as a three-phase session (start, append, finish) and
//! large ranged downloads as a sequence of range fetches. Both share one
//! retry machine: transient failures are retried from the offset the server
//! confirms, with quadratic backoff, until the attempt budget runs out.

pub mod backoff;
pub mod download;
pub mod sink;
pub mod upload;

use thiserror::Error;

use cloudtree_common::Error;

pub use backoff::{RecordingSleeper, RetryState, Sleeper, TokioSleeper};
pub use download::{ChunkSink, ChunkedDownloader, RangeSource};
pub use sink::ReadSink;
pub use upload::{ChunkedUploader, UploadSession};

/// Outcome of one failed transfer step.
///
/// Everything except `Fatal` is retried by the engine and never reaches the
/// caller unless the attempt budget is exhausted.
#[derive(Debug, Error)]
pub enum TransferFailure {
    /// Transport-level failure (connection reset, timeout).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Server asked the client to retry (throttling, 5xx).
    #[error("server requested retry")]
    Retry,

    /// Server rejected the chunk offset and reported the one it expects.
    #[error("incorrect offset, server expects byte {expected}")]
    IncorrectOffset { expected: u64 },

    /// Non-retryable failure, surfaced as-is.
    #[error(transparent)]
    Fatal(#[from] Error),
}

impl TransferFailure {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransferFailure::Fatal(_))
    }
}
