//! Execution statistics
//!
//! Per-task counters and timing aggregates, plus the scheduler-wide
//! counters. Snapshots are plain `Copy` values taken under the registry lock,
//! so a reader never sees a half-updated record.
//!
//! Author: Moroya Sakamoto

/// Per-task statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStatistics {
    /// Completed dispatches
    pub executions: u64,
    /// Dispatches that finished after their deadline
    pub missed_deadlines: u64,
    /// Observed lifecycle state changes
    pub context_switches: u64,
    /// Dispatches whose work closure failed
    pub failures: u64,
    /// Sum of execution durations (µs)
    pub total_execution_us: u64,
    /// Shortest execution (µs), 0 before the first dispatch
    pub min_execution_us: u64,
    /// Longest execution (µs)
    pub max_execution_us: u64,
    /// Creation timestamp (µs)
    pub created_at_us: u64,
    /// Start of the most recent dispatch (µs)
    pub last_execution_us: u64,
}

impl TaskStatistics {
    pub fn new(created_at_us: u64) -> Self {
        Self {
            created_at_us,
            last_execution_us: created_at_us,
            ..Self::default()
        }
    }

    /// Fold one finished dispatch into the aggregates
    pub fn record_execution(&mut self, started_us: u64, finished_us: u64) {
        let duration = finished_us.saturating_sub(started_us);
        self.executions += 1;
        self.last_execution_us = started_us;
        self.total_execution_us = self.total_execution_us.saturating_add(duration);
        if self.executions == 1 {
            self.min_execution_us = duration;
            self.max_execution_us = duration;
        } else {
            self.min_execution_us = self.min_execution_us.min(duration);
            self.max_execution_us = self.max_execution_us.max(duration);
        }
    }

    /// Average execution time in microseconds
    pub fn average_execution_us(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_execution_us as f64 / self.executions as f64
        }
    }

    /// Observed CPU utilization in percent (average execution / period)
    pub fn cpu_utilization(&self, period_us: u64) -> f64 {
        if period_us == 0 || self.executions == 0 {
            0.0
        } else {
            self.average_execution_us() / period_us as f64 * 100.0
        }
    }

    /// Clear counters, restarting the record at `now_us`
    pub fn reset(&mut self, now_us: u64) {
        *self = Self::new(now_us);
    }
}

/// Scheduler-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerCounters {
    /// Work closures dispatched
    pub total_dispatches: u64,
    /// Deadline misses across all tasks
    pub total_missed_deadlines: u64,
    /// Work closure failures across all tasks
    pub total_failures: u64,
    /// State changes across all tasks
    pub total_context_switches: u64,
    /// `run_once` calls that found nothing eligible
    pub idle_decisions: u64,
    /// Events dropped because the queue was full
    pub dropped_events: u64,
    /// Non-terminated tasks currently registered
    pub active_tasks: usize,
}
