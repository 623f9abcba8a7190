//! Scheduler configuration
//!
//! Author: Moroya Sakamoto

use core::time::Duration;

use crate::failure::FailurePolicy;

/// Default registry capacity
pub const MAX_TASKS: usize = 64;

/// Default event queue depth
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default number of failure records kept by `FailureLog`
pub const DEFAULT_FAILURE_LOG_CAPACITY: usize = 128;

/// Longest single idle sleep when no release is pending
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Tunables for a `Scheduler`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum registered tasks
    pub max_tasks: usize,
    /// What happens to a task whose work closure fails
    pub failure_policy: FailurePolicy,
    /// Bounded event queue depth; overflow is dropped and counted
    pub event_capacity: usize,
    /// Records retained by the default failure sink
    pub failure_log_capacity: usize,
    /// Upper bound on one idle sleep of `run`
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks: MAX_TASKS,
            failure_policy: FailurePolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            failure_log_capacity: DEFAULT_FAILURE_LOG_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_failure_log_capacity(mut self, capacity: usize) -> Self {
        self.failure_log_capacity = capacity;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}
