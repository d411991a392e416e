//! Download destination that tees into the content cache.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use cloudtree_common::Result;

use super::download::ChunkSink;
use crate::content_cache::{CacheWriter, ContentCache};
use crate::io::DataSink;
use crate::progress::ProgressReporter;

/// Writes downloaded bytes to the caller's destination, reports progress and
/// stores a copy in the content cache.
///
/// Cache failures never fail the read: a broken entry falls back to the
/// network and a failed store is logged and dropped.
pub struct ReadSink<'a> {
    dest: &'a mut DataSink,
    reporter: ProgressReporter<'a>,
    cache: Option<&'a ContentCache>,
    writer: Option<CacheWriter>,
    written: u64,
    served_from_cache: bool,
}

impl<'a> ReadSink<'a> {
    /// Emit `started` and try the cache.
    ///
    /// `cached` is the cache and the revision fingerprint of the file, when
    /// caching applies. If an intact entry exists it is copied to `dest`,
    /// `completed` is emitted and [`served_from_cache`](Self::served_from_cache)
    /// returns true; the caller must then skip the network download.
    pub async fn begin(
        cached: Option<(&'a ContentCache, &str)>,
        dest: &'a mut DataSink,
        reporter: ProgressReporter<'a>,
    ) -> Result<ReadSink<'a>> {
        reporter.started();
        let mut sink = ReadSink {
            dest,
            reporter,
            cache: None,
            writer: None,
            written: 0,
            served_from_cache: false,
        };

        let Some((cache, fingerprint)) = cached else {
            return Ok(sink);
        };
        sink.cache = Some(cache);

        match cache.get(fingerprint).await {
            Ok(Some(content)) => {
                debug!("Serving {} from content cache", fingerprint);
                sink.dest.write_all(&content).await?;
                sink.dest.flush().await?;
                sink.written = content.len() as u64;
                sink.served_from_cache = true;
                sink.reporter.set_total(Some(sink.written));
                sink.reporter.completed(sink.written);
                return Ok(sink);
            }
            Ok(None) => {}
            Err(e) => warn!("Content cache entry {} unreadable, downloading: {}", fingerprint, e),
        }

        match cache.writer(fingerprint).await {
            Ok(writer) => sink.writer = Some(writer),
            Err(e) => warn!("Cannot cache {}: {}", fingerprint, e),
        }
        Ok(sink)
    }

    pub fn served_from_cache(&self) -> bool {
        self.served_from_cache
    }

    /// Set the total once the backend reports it.
    pub fn set_total(&mut self, total: Option<u64>) {
        self.reporter.set_total(total);
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush the destination, commit the cache entry and emit `completed`.
    pub async fn finish(mut self) -> Result<u64> {
        if self.served_from_cache {
            return Ok(self.written);
        }

        self.dest.flush().await?;

        if let (Some(writer), Some(cache)) = (self.writer.take(), self.cache) {
            if let Err(e) = writer.commit(cache).await {
                warn!("Failed to store download in content cache: {}", e);
            }
        }

        if self.reporter.total().is_none() {
            self.reporter.set_total(Some(self.written));
        }
        self.reporter.completed(self.written);
        Ok(self.written)
    }
}

#[async_trait]
impl ChunkSink for ReadSink<'_> {
    async fn accept(&mut self, data: &[u8]) -> Result<()> {
        self.dest.write_all(data).await?;
        self.written += data.len() as u64;

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write(data).await {
                warn!("Dropping content cache write: {}", e);
                self.writer = None;
            }
        }

        self.reporter.progress(self.written);
        Ok(())
    }
}
