//! Chunked upload driver.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

use cloudtree_common::Result;

use super::backoff::{RetryState, Sleeper};
use super::TransferFailure;
use crate::config::StorageConfig;
use crate::io::{open_at, read_chunk, ByteReader, DataSource};
use crate::progress::ProgressReporter;

/// Backend side of a resumable upload.
///
/// Offsets are absolute byte positions in the file. `start` may carry the
/// first chunk; `finish` carries the last (possibly empty) chunk and commits.
#[async_trait]
pub trait UploadSession: Send {
    type Output: Send;

    async fn start(&mut self, first: Bytes) -> std::result::Result<(), TransferFailure>;

    async fn append(&mut self, offset: u64, chunk: Bytes) -> std::result::Result<(), TransferFailure>;

    async fn finish(
        &mut self,
        offset: u64,
        last: Bytes,
    ) -> std::result::Result<Self::Output, TransferFailure>;

    /// Bytes the server has durably received, if the backend can tell.
    async fn committed_offset(&mut self) -> Option<u64> {
        None
    }
}

/// Drives an [`UploadSession`] to completion.
pub struct ChunkedUploader {
    chunk_size: usize,
    max_attempts: u32,
    step: std::time::Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl ChunkedUploader {
    pub fn new(config: &StorageConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            max_attempts: config.max_attempts,
            step: config.backoff_step(),
            sleeper,
        }
    }

    /// Upload `total` bytes from `source` through `session`.
    ///
    /// Progress is reported after every acknowledged chunk with the
    /// cumulative byte count.
    pub async fn upload<S: UploadSession>(
        &self,
        session: &mut S,
        source: &dyn DataSource,
        total: u64,
        reporter: &ProgressReporter<'_>,
        what: &str,
    ) -> Result<S::Output> {
        let mut state = RetryState::new(self.max_attempts, self.step);
        let mut reader = open_at(source, 0, what).await?;

        loop {
            match self.drive(session, &mut reader, &mut state, total, reporter, what).await {
                Ok(output) => {
                    if state.attempt() > 1 {
                        debug!("Upload of {} succeeded on attempt {}", what, state.attempt());
                    }
                    return Ok(output);
                }
                Err(TransferFailure::Fatal(e)) => return Err(e),
                Err(failure) => {
                    let server_offset = match &failure {
                        TransferFailure::IncorrectOffset { expected } => Some(*expected),
                        _ if state.is_started() => session.committed_offset().await,
                        _ => None,
                    };
                    let delay = state.record_failure(&failure, server_offset)?;
                    warn!(
                        "Upload of {} failed on attempt {}: {}. Resuming at byte {} in {:?}",
                        what,
                        state.attempt() - 1,
                        failure,
                        state.offset(),
                        delay
                    );
                    self.sleeper.sleep(delay).await;
                    reader = open_at(source, state.offset(), what).await?;
                }
            }
        }
    }

    async fn drive<S: UploadSession>(
        &self,
        session: &mut S,
        reader: &mut ByteReader,
        state: &mut RetryState,
        total: u64,
        reporter: &ProgressReporter<'_>,
        what: &str,
    ) -> std::result::Result<S::Output, TransferFailure> {
        loop {
            let offset = state.offset();
            let remaining = total.saturating_sub(offset);
            let len = remaining.min(self.chunk_size as u64) as usize;
            let chunk = read_chunk(reader, len, what).await?;

            if !state.is_started() {
                session.start(chunk).await?;
                state.mark_started();
                state.advance(len as u64);
                reporter.progress(state.offset());
                continue;
            }

            if len as u64 == remaining {
                let output = session.finish(offset, chunk).await?;
                state.advance(len as u64);
                if len > 0 {
                    reporter.progress(state.offset());
                }
                return Ok(output);
            }

            session.append(offset, chunk).await?;
            state.advance(len as u64);
            reporter.progress(state.offset());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BytesSource;
    use crate::progress::{Direction, ProgressLog};
    use crate::transfer::RecordingSleeper;
    use cloudtree_common::{CloudFile, CloudFolder, CloudId, Error};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted session that assembles the uploaded bytes like a server.
    #[derive(Default)]
    struct ScriptedSession {
        received: Vec<u8>,
        calls: Vec<(String, u64, usize)>,
        failures: VecDeque<(&'static str, TransferFailure)>,
        report_committed: Option<u64>,
    }

    impl ScriptedSession {
        fn fail_on(&mut self, op: &'static str, failure: TransferFailure) {
            self.failures.push_back((op, failure));
        }

        fn check(&mut self, op: &'static str) -> std::result::Result<(), TransferFailure> {
            if matches!(self.failures.front(), Some((o, _)) if *o == op) {
                let (_, failure) = self.failures.pop_front().unwrap();
                return Err(failure);
            }
            Ok(())
        }

        fn accept(&mut self, offset: u64, data: &[u8]) -> std::result::Result<(), TransferFailure> {
            if offset != self.received.len() as u64 {
                return Err(TransferFailure::IncorrectOffset {
                    expected: self.received.len() as u64,
                });
            }
            self.received.extend_from_slice(data);
            Ok(())
        }
    }

    #[async_trait]
    impl UploadSession for ScriptedSession {
        type Output = Vec<u8>;

        async fn start(&mut self, first: Bytes) -> std::result::Result<(), TransferFailure> {
            self.calls.push(("start".into(), 0, first.len()));
            self.check("start")?;
            self.received.clear();
            self.accept(0, &first)
        }

        async fn append(&mut self, offset: u64, chunk: Bytes) -> std::result::Result<(), TransferFailure> {
            self.calls.push(("append".into(), offset, chunk.len()));
            self.check("append")?;
            self.accept(offset, &chunk)
        }

        async fn finish(&mut self, offset: u64, last: Bytes) -> std::result::Result<Vec<u8>, TransferFailure> {
            self.calls.push(("finish".into(), offset, last.len()));
            self.check("finish")?;
            self.accept(offset, &last)?;
            Ok(self.received.clone())
        }

        async fn committed_offset(&mut self) -> Option<u64> {
            self.report_committed
        }
    }

    fn uploader(sleeper: Arc<RecordingSleeper>) -> ChunkedUploader {
        let config = StorageConfig::default()
            .with_chunk_size(4)
            .with_max_attempts(5)
            .with_backoff_step(Duration::from_millis(100));
        ChunkedUploader::new(&config, sleeper)
    }

    fn file() -> CloudFile {
        let root = CloudFolder::root(CloudId::new("memory", "t").unwrap());
        CloudFile::new(&root, "big.bin", None).unwrap()
    }

    #[tokio::test]
    async fn test_three_phase_upload() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let uploader = uploader(sleeper.clone());
        let source = BytesSource::new(&b"0123456789"[..]);
        let log = ProgressLog::new();
        let reporter = ProgressReporter::new(&log, &file(), Direction::Upload, Some(10));
        let mut session = ScriptedSession::default();

        let out = uploader
            .upload(&mut session, &source, 10, &reporter, "big.bin")
            .await
            .unwrap();

        assert_eq!(out, b"0123456789".to_vec());
        assert_eq!(
            session.calls,
            vec![
                ("start".to_string(), 0, 4),
                ("append".to_string(), 4, 4),
                ("finish".to_string(), 8, 2),
            ]
        );
        let cumulative: Vec<u64> = log.events().iter().map(|e| e.bytes_transferred).collect();
        assert_eq!(cumulative, vec![4, 8, 10]);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_exact_multiple_finishes_with_last_full_chunk() {
        let uploader = uploader(Arc::new(RecordingSleeper::new()));
        let source = BytesSource::new(&b"01234567"[..]);
        let log = ProgressLog::new();
        let reporter = ProgressReporter::new(&log, &file(), Direction::Upload, Some(8));
        let mut session = ScriptedSession::default();

        uploader
            .upload(&mut session, &source, 8, &reporter, "big.bin")
            .await
            .unwrap();

        assert_eq!(session.calls.last().unwrap(), &("finish".to_string(), 4, 4));
    }

    #[tokio::test]
    async fn test_resumes_from_server_reported_offset() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let uploader = uploader(sleeper.clone());
        let source = BytesSource::new(&b"abcdefghijkl"[..]);
        let log = ProgressLog::new();
        let reporter = ProgressReporter::new(&log, &file(), Direction::Upload, Some(12));

        // The server only kept the first 2 bytes of the session and says so.
        let mut session = ScriptedSession::default();
        session.fail_on("append", TransferFailure::IncorrectOffset { expected: 2 });

        // Make the server state match its report.
        let out = {
            struct Truncating(ScriptedSession);

            #[async_trait]
            impl UploadSession for Truncating {
                type Output = Vec<u8>;

                async fn start(&mut self, first: Bytes) -> std::result::Result<(), TransferFailure> {
                    self.0.start(first).await
                }

                async fn append(&mut self, offset: u64, chunk: Bytes) -> std::result::Result<(), TransferFailure> {
                    let result = self.0.append(offset, chunk).await;
                    if let Err(TransferFailure::IncorrectOffset { expected }) = &result {
                        self.0.received.truncate(*expected as usize);
                    }
                    result
                }

                async fn finish(&mut self, offset: u64, last: Bytes) -> std::result::Result<Vec<u8>, TransferFailure> {
                    self.0.finish(offset, last).await
                }
            }

            let mut truncating = Truncating(session);
            let out = uploader
                .upload(&mut truncating, &source, 12, &reporter, "big.bin")
                .await
                .unwrap();
            session = truncating.0;
            out
        };

        assert_eq!(out, b"abcdefghijkl".to_vec());
        // Attempt 2 restarts at byte 2: neither 0 nor the locally tracked 4.
        assert_eq!(session.calls[1], ("append".to_string(), 4, 4));
        assert_eq!(session.calls[2], ("append".to_string(), 2, 4));
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test]
    async fn test_transient_failure_uses_committed_offset() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let uploader = uploader(sleeper.clone());
        let source = BytesSource::new(&b"abcdefghijkl"[..]);
        let log = ProgressLog::new();
        let reporter = ProgressReporter::new(&log, &file(), Direction::Upload, Some(12));

        let mut session = ScriptedSession::default();
        session.fail_on("append", TransferFailure::Transient("connection reset".into()));
        session.report_committed = Some(4);

        let out = uploader
            .upload(&mut session, &source, 12, &reporter, "big.bin")
            .await
            .unwrap();

        assert_eq!(out, b"abcdefghijkl".to_vec());
        assert_eq!(session.calls[2], ("append".to_string(), 4, 4));
    }

    #[tokio::test]
    async fn test_failed_start_restarts_session() {
        let uploader = uploader(Arc::new(RecordingSleeper::new()));
        let source = BytesSource::new(&b"abcdef"[..]);
        let log = ProgressLog::new();
        let reporter = ProgressReporter::new(&log, &file(), Direction::Upload, Some(6));

        let mut session = ScriptedSession::default();
        session.fail_on("start", TransferFailure::Retry);

        let out = uploader
            .upload(&mut session, &source, 6, &reporter, "big.bin")
            .await
            .unwrap();

        assert_eq!(out, b"abcdef".to_vec());
        assert_eq!(session.calls[0], ("start".to_string(), 0, 4));
        assert_eq!(session.calls[1], ("start".to_string(), 0, 4));
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let uploader = uploader(sleeper.clone());
        let source = BytesSource::new(&b"abcdefghij"[..]);
        let log = ProgressLog::new();
        let reporter = ProgressReporter::new(&log, &file(), Direction::Upload, Some(10));

        let mut session = ScriptedSession::default();
        for _ in 0..5 {
            session.fail_on("start", TransferFailure::Transient("down".into()));
        }

        let err = uploader
            .upload(&mut session, &source, 10, &reporter, "big.bin")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Fatal { .. }));
        assert_eq!(session.calls.len(), 5);
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(400),
                Duration::from_millis(900),
                Duration::from_millis(1600),
            ]
        );
    }

    #[tokio::test]
    async fn test_fatal_failure_not_retried() {
        let uploader = uploader(Arc::new(RecordingSleeper::new()));
        let source = BytesSource::new(&b"abcdefghij"[..]);
        let log = ProgressLog::new();
        let reporter = ProgressReporter::new(&log, &file(), Direction::Upload, Some(10));

        let mut session = ScriptedSession::default();
        session.fail_on(
            "append",
            TransferFailure::Fatal(Error::Forbidden("/big.bin".into())),
        );

        let err = uploader
            .upload(&mut session, &source, 10, &reporter, "big.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(session.calls.len(), 2);
    }
}
