//! Scripted failures and call counters for the in-memory native APIs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Per-operation failure script.
///
/// Each operation name has a queue of outcomes consumed one per call:
/// `None` lets the call through, `Some(e)` fails it with `e`. An empty queue
/// lets every call through.
#[derive(Debug)]
pub struct FaultPlan<E> {
    queues: Mutex<HashMap<&'static str, VecDeque<Option<E>>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl<E> Default for FaultPlan<E> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<E: Clone> FaultPlan<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call to `op`.
    pub fn inject(&self, op: &'static str, error: E) {
        self.inject_after(op, 0, error);
    }

    /// Let `successes` calls to `op` through, then fail one.
    pub fn inject_after(&self, op: &'static str, successes: usize, error: E) {
        if let Ok(mut queues) = self.queues.lock() {
            let queue = queues.entry(op).or_default();
            queue.extend(std::iter::repeat_with(|| None).take(successes));
            queue.push_back(Some(error));
        }
    }

    /// Fail the next `times` calls to `op`.
    pub fn inject_times(&self, op: &'static str, times: usize, error: E) {
        for _ in 0..times {
            self.inject(op, error.clone());
        }
    }

    /// Count a call to `op` and return its scripted outcome.
    pub fn check(&self, op: &'static str) -> Result<(), E> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_default() += 1;
        }
        let scripted = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(op).and_then(VecDeque::pop_front));
        match scripted {
            Some(Some(error)) => Err(error),
            _ => Ok(()),
        }
    }

    /// Calls made to `op` so far, failed ones included.
    pub fn calls(&self, op: &str) -> usize {
        self.calls
            .lock()
            .ok()
            .and_then(|calls| calls.get(op).copied())
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_order() {
        let plan: FaultPlan<&'static str> = FaultPlan::new();
        plan.inject_after("append", 2, "boom");

        assert!(plan.check("append").is_ok());
        assert!(plan.check("append").is_ok());
        assert_eq!(plan.check("append"), Err("boom"));
        assert!(plan.check("append").is_ok());
        assert!(plan.check("finish").is_ok());

        assert_eq!(plan.calls("append"), 4);
        assert_eq!(plan.total_calls(), 5);
    }

    #[test]
    fn test_inject_times() {
        let plan: FaultPlan<u8> = FaultPlan::new();
        plan.inject_times("get", 2, 7);
        assert_eq!(plan.check("get"), Err(7));
        assert_eq!(plan.check("get"), Err(7));
        assert_eq!(plan.check("get"), Ok(()));
    }
}
