//! Retry bookkeeping for chunked transfers.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use cloudtree_common::{Error, Result};

use super::TransferFailure;

/// Waits between retry attempts.
///
/// Injected so the retry machine can be exercised without real timers.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(delay);
        }
    }
}

/// State of one chunked transfer: attempt count, confirmed offset and the
/// last failure seen.
#[derive(Debug)]
pub struct RetryState {
    max_attempts: u32,
    step: Duration,
    failures: u32,
    offset: u64,
    started: bool,
    last_error: Option<String>,
}

impl RetryState {
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            step,
            failures: 0,
            offset: 0,
            started: false,
            last_error: None,
        }
    }

    /// Attempt currently running, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.failures + 1
    }

    /// Bytes confirmed by the remote side.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn advance(&mut self, bytes: u64) {
        self.offset += bytes;
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Delay before attempt `failures + 1`: `step * failures²`.
    pub fn backoff(&self, failures: u32) -> Duration {
        self.step * failures.saturating_mul(failures)
    }

    /// Record a transient failure and pick the resume offset.
    ///
    /// An offset reported by the server wins over local bookkeeping; a
    /// session that never started always restarts from zero. Returns the
    /// delay to wait before the next attempt, or a fatal error once the
    /// attempt budget is spent.
    pub fn record_failure(
        &mut self,
        failure: &TransferFailure,
        server_offset: Option<u64>,
    ) -> Result<Duration> {
        self.failures += 1;
        self.last_error = Some(failure.to_string());

        if self.failures >= self.max_attempts {
            return Err(Error::fatal_msg(
                format!("transfer gave up after {} attempts", self.failures),
                failure.to_string(),
            ));
        }

        self.offset = if self.started {
            server_offset.unwrap_or(self.offset)
        } else {
            0
        };

        Ok(self.backoff(self.failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic_backoff() {
        let state = RetryState::new(5, Duration::from_millis(200));
        assert_eq!(state.backoff(1), Duration::from_millis(200));
        assert_eq!(state.backoff(2), Duration::from_millis(800));
        assert_eq!(state.backoff(3), Duration::from_millis(1800));
    }

    #[test]
    fn test_server_offset_wins() {
        let mut state = RetryState::new(5, Duration::from_millis(1));
        state.mark_started();
        state.advance(300);

        state
            .record_failure(&TransferFailure::IncorrectOffset { expected: 100 }, Some(100))
            .unwrap();
        assert_eq!(state.offset(), 100);
        assert_eq!(state.attempt(), 2);
    }

    #[test]
    fn test_client_offset_without_server_report() {
        let mut state = RetryState::new(5, Duration::from_millis(1));
        state.mark_started();
        state.advance(300);

        state
            .record_failure(&TransferFailure::Transient("reset".into()), None)
            .unwrap();
        assert_eq!(state.offset(), 300);
    }

    #[test]
    fn test_unstarted_session_restarts_from_zero() {
        let mut state = RetryState::new(5, Duration::from_millis(1));
        state.advance(50);

        state
            .record_failure(&TransferFailure::Retry, Some(50))
            .unwrap();
        assert_eq!(state.offset(), 0);
    }

    #[test]
    fn test_budget_exhaustion_is_fatal() {
        let mut state = RetryState::new(3, Duration::from_millis(1));
        let failure = TransferFailure::Transient("timeout".into());

        assert!(state.record_failure(&failure, None).is_ok());
        assert!(state.record_failure(&failure, None).is_ok());
        let err = state.record_failure(&failure, None).unwrap_err();
        assert!(matches!(err, Error::Fatal { .. }));
        assert_eq!(state.last_error(), Some("transient failure: timeout"));
    }
}
