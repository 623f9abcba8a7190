//! Work failure recording
//!
//! A failing work closure never stops the dispatch loop. The failure is
//! caught at the dispatch boundary, described as a `TaskFailure`, handed to
//! the configured `FailureSink`, and the task is then handled according to
//! the `FailurePolicy`.
//!
//! Author: Moroya Sakamoto

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::SchedulerError;
use crate::task::TaskId;

/// What to do with a task whose work closure failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Mark the task TERMINATED
    #[default]
    Terminate,
    /// Re-arm the task by its kind's normal rule (retry next release)
    Rearm,
}

/// How a work closure failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The closure returned an error
    Error(String),
    /// The closure panicked
    Panic(String),
    /// An event handler panicked while the dispatch loop delivered events
    Handler(String),
}

impl FailureCause {
    /// Describe a panic payload caught by `catch_unwind`
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        FailureCause::Panic(msg)
    }

    pub fn message(&self) -> &str {
        match self {
            FailureCause::Error(m) | FailureCause::Panic(m) | FailureCause::Handler(m) => m,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Error(m) => write!(f, "error: {m}"),
            FailureCause::Panic(m) => write!(f, "panic: {m}"),
            FailureCause::Handler(m) => write!(f, "event handler panic: {m}"),
        }
    }
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub id: TaskId,
    pub name: String,
    /// Time the failure was observed (µs)
    pub at_us: u64,
    pub cause: FailureCause,
}

impl TaskFailure {
    /// The failure as a scheduler error kind
    pub fn to_error(&self) -> SchedulerError {
        SchedulerError::TaskWorkFailure {
            id: self.id,
            reason: self.cause.to_string(),
        }
    }
}

/// Receiver of work failures
///
/// Called by the dispatch loop outside the registry lock. Implementations
/// must not block for long.
pub trait FailureSink: Send + Sync {
    fn record(&self, failure: TaskFailure);
}

/// Default sink: logs each failure and keeps the most recent ones
#[derive(Debug)]
pub struct FailureLog {
    records: Mutex<VecDeque<TaskFailure>>,
    capacity: usize,
    total: AtomicU64,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total: AtomicU64::new(0),
        }
    }

    /// Retained records, oldest first
    pub fn records(&self) -> Vec<TaskFailure> {
        self.records.lock().iter().cloned().collect()
    }

    /// Failures recorded since creation, including evicted ones
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl FailureSink for FailureLog {
    fn record(&self, failure: TaskFailure) {
        log::error!(
            "task '{}' (id {}) failed at {}us: {}",
            failure.name,
            failure.id,
            failure.at_us,
            failure.cause
        );
        self.total.fetch_add(1, Ordering::Relaxed);
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(failure);
    }
}
