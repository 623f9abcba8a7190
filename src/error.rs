//! Scheduler error kinds
//!
//! Configuration errors are returned to the caller; work failures and
//! deadline misses never escape the dispatch loop and only show up in
//! events, statistics and the failure sink.
//!
//! Author: Moroya Sakamoto

use crate::task::{TaskId, TaskState};

/// Error type returned by work closures.
pub type WorkError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by the scheduler API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("cannot change priority of task {0} while it is running")]
    InvalidPriorityChangeWhileRunning(TaskId),

    #[error("task {0} is not periodic; period cannot be set")]
    InvalidPeriodOnNonPeriodicTask(TaskId),

    #[error("task id {0} already registered")]
    DuplicateTaskId(TaskId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {id} missed its deadline at {deadline_us}us (finished {finished_us}us)")]
    DeadlineMissed {
        id: TaskId,
        deadline_us: u64,
        finished_us: u64,
    },

    #[error("task {id} work failed: {reason}")]
    TaskWorkFailure { id: TaskId, reason: String },

    #[error("cannot {op} task {id} in state {state}")]
    InvalidStateTransition {
        id: TaskId,
        state: TaskState,
        op: &'static str,
    },

    #[error("invalid timing: {0}")]
    InvalidTiming(&'static str),

    #[error("task registry full ({capacity} tasks)")]
    RegistryFull { capacity: usize },
}

impl SchedulerError {
    /// Soft errors are recorded but never returned from the API.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SchedulerError::DeadlineMissed { .. } | SchedulerError::TaskWorkFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SchedulerError::DuplicateTaskId(TaskId(7));
        assert_eq!(err.to_string(), "task id 7 already registered");

        let err = SchedulerError::InvalidStateTransition {
            id: TaskId(3),
            state: TaskState::Running,
            op: "suspend",
        };
        assert_eq!(err.to_string(), "cannot suspend task 3 in state RUNNING");
    }

    #[test]
    fn test_soft_errors() {
        assert!(SchedulerError::TaskWorkFailure { id: TaskId(1), reason: "x".into() }.is_soft());
        assert!(!SchedulerError::TaskNotFound(TaskId(1)).is_soft());
    }
}
