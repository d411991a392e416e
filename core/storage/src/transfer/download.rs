//! Ranged download driver and stream pumping.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use cloudtree_common::{Error, Result};

use super::backoff::{RetryState, Sleeper};
use super::TransferFailure;
use crate::config::StorageConfig;
use crate::io::ByteStream;

/// Backend side of a ranged download.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Fetch `len` bytes starting at `offset`.
    async fn fetch(&self, offset: u64, len: u64) -> std::result::Result<Bytes, TransferFailure>;
}

/// Consumer of downloaded bytes, in order.
#[async_trait]
pub trait ChunkSink: Send {
    async fn accept(&mut self, data: &[u8]) -> Result<()>;
}

/// Downloads a file of known size range by range.
///
/// A failed range is retried from the number of bytes already delivered to
/// the sink, so the sink never sees a byte twice.
pub struct ChunkedDownloader {
    chunk_size: u64,
    max_attempts: u32,
    step: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl ChunkedDownloader {
    pub fn new(config: &StorageConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1) as u64,
            max_attempts: config.max_attempts,
            step: config.backoff_step(),
            sleeper,
        }
    }

    /// Returns the number of bytes delivered.
    pub async fn download(
        &self,
        source: &dyn RangeSource,
        total: u64,
        sink: &mut dyn ChunkSink,
        what: &str,
    ) -> Result<u64> {
        let mut state = RetryState::new(self.max_attempts, self.step);
        state.mark_started();

        while state.offset() < total {
            let offset = state.offset();
            let len = (total - offset).min(self.chunk_size);

            match source.fetch(offset, len).await {
                Ok(data) if data.is_empty() => {
                    return Err(Error::fatal_msg(
                        format!("download {}", what),
                        format!("server returned no data at byte {} of {}", offset, total),
                    ));
                }
                Ok(data) => {
                    // A server may return less than asked; never more than remains.
                    let take = (data.len() as u64).min(total - offset) as usize;
                    sink.accept(&data[..take]).await?;
                    state.advance(take as u64);
                }
                Err(TransferFailure::Fatal(e)) => return Err(e),
                Err(failure) => {
                    let delay = state.record_failure(&failure, None)?;
                    warn!(
                        "Download of {} failed on attempt {}: {}. Resuming at byte {} in {:?}",
                        what,
                        state.attempt() - 1,
                        failure,
                        state.offset(),
                        delay
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        Ok(state.offset())
    }
}

/// Copy a native byte stream into `sink`, mapping stream errors with `map_err`.
pub async fn pump_stream<E>(
    mut stream: ByteStream<E>,
    sink: &mut dyn ChunkSink,
    map_err: impl Fn(E) -> Error + Send,
) -> Result<u64> {
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(&map_err)?;
        sink.accept(&chunk).await?;
        total += chunk.len() as u64;
    }
    Ok(total)
}
