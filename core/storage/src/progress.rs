//! Transfer progress reporting.
//!
//! Sinks are called synchronously from the task performing the I/O, so they
//! must not block.

use std::sync::Mutex;

use cloudtree_common::CloudFile;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Progress,
    Completed,
}

/// One progress event.
#[derive(Debug, Clone)]
pub struct TransferState {
    pub file: CloudFile,
    pub direction: Direction,
    pub phase: Phase,
    /// Cumulative bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total size, `None` when the backend cannot report it upfront.
    pub bytes_total: Option<u64>,
}

impl TransferState {
    /// Progress as a fraction in `[0, 1]`, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_transferred as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Receiver of transfer progress events.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, state: &TransferState);
}

impl<F> ProgressSink for F
where
    F: Fn(&TransferState) + Send + Sync,
{
    fn on_progress(&self, state: &TransferState) {
        self(state)
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _state: &TransferState) {}
}

/// Sink that records every event, handy in tests and for batch summaries.
#[derive(Debug, Default)]
pub struct ProgressLog {
    events: Mutex<Vec<TransferState>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransferState> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.events().into_iter().map(|e| e.phase).collect()
    }
}

impl ProgressSink for ProgressLog {
    fn on_progress(&self, state: &TransferState) {
        if let Ok(mut events) = self.events.lock() {
            events.push(state.clone());
        }
    }
}

/// Emits the started/progress/completed lifecycle for one file.
pub struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    file: CloudFile,
    direction: Direction,
    total: Option<u64>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(
        sink: &'a dyn ProgressSink,
        file: &CloudFile,
        direction: Direction,
        total: Option<u64>,
    ) -> Self {
        Self {
            sink,
            file: file.clone(),
            direction,
            total,
        }
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn started(&self) {
        self.emit(Phase::Started, 0);
    }

    pub fn progress(&self, transferred: u64) {
        self.emit(Phase::Progress, transferred);
    }

    pub fn completed(&self, transferred: u64) {
        self.emit(Phase::Completed, transferred);
    }

    fn emit(&self, phase: Phase, transferred: u64) {
        self.sink.on_progress(&TransferState {
            file: self.file.clone(),
            direction: self.direction,
            phase,
            bytes_transferred: transferred,
            bytes_total: self.total,
        });
    }
}
