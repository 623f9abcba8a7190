//! Task definition — descriptors, timing, and the task state machine
//!
//! A task is a unit of work with a priority, a release policy (its kind),
//! timing constraints and an opaque work closure. Lifecycle transitions are
//! driven by the scheduler; the descriptor only validates and applies them.
//!
//! Author: Moroya Sakamoto

use core::fmt;
use core::time::Duration;

use crate::error::{SchedulerError, WorkError};
use crate::failure::FailurePolicy;
use crate::stats::TaskStatistics;
use crate::timer::{duration_us, Deadline};

/// Task work closure — invoked synchronously by the dispatch loop only
pub type TaskFn = Box<dyn FnMut() -> Result<(), WorkError> + Send>;

/// Unique task identifier, never reused by an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task priority (lower number = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskPriority(pub u8);

impl TaskPriority {
    /// Interrupt-level work
    pub const INTERRUPT: TaskPriority = TaskPriority(0);
    /// Highest application priority
    pub const CRITICAL: TaskPriority = TaskPriority(10);
    pub const VERY_HIGH: TaskPriority = TaskPriority(25);
    pub const HIGH: TaskPriority = TaskPriority(50);
    pub const NORMAL: TaskPriority = TaskPriority(100);
    pub const LOW: TaskPriority = TaskPriority(150);
    pub const VERY_LOW: TaskPriority = TaskPriority(200);
    /// Background (non-real-time)
    pub const IDLE: TaskPriority = TaskPriority(255);

    /// Preset name, if this value is one of the presets
    pub fn preset_name(self) -> Option<&'static str> {
        Some(match self.0 {
            0 => "INTERRUPT",
            10 => "CRITICAL",
            25 => "VERY_HIGH",
            50 => "HIGH",
            100 => "NORMAL",
            150 => "LOW",
            200 => "VERY_LOW",
            255 => "IDLE",
            _ => return None,
        })
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::NORMAL
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.preset_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "CUSTOM_{}", self.0),
        }
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for its release time or for the CPU
    Ready,
    /// Work closure is executing
    Running,
    /// Sporadic task inside its minimum inter-arrival window
    Blocked,
    /// Excluded from scheduling until resumed
    Suspended,
    /// Never selected again
    Terminated,
    /// Sleeping until its release time
    Sleeping,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Blocked => "BLOCKED",
            TaskState::Suspended => "SUSPENDED",
            TaskState::Terminated => "TERMINATED",
            TaskState::Sleeping => "SLEEPING",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release policy after each execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Re-armed on a fixed phase grid, one period apart
    Periodic,
    /// Runs once per external trigger
    Aperiodic,
    /// Re-armed no sooner than `min_interarrival_us` after its last dispatch
    Sporadic { min_interarrival_us: u64 },
    /// Runs once, then terminates
    OneShot,
}

impl TaskKind {
    /// Sporadic kind with a `Duration` inter-arrival bound
    pub fn sporadic(min_interarrival: Duration) -> Self {
        TaskKind::Sporadic {
            min_interarrival_us: duration_us(min_interarrival),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Periodic => "PERIODIC",
            TaskKind::Aperiodic => "APERIODIC",
            TaskKind::Sporadic { .. } => "SPORADIC",
            TaskKind::OneShot => "ONE_SHOT",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing constraints, all in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    /// Period (periodic tasks only)
    pub period_us: u64,
    /// Relative deadline
    pub deadline_us: u64,
    /// Estimated execution time
    pub execution_us: u64,
    /// Worst-case execution time (advisory, never enforced)
    pub wcet_us: u64,
}

impl TaskTiming {
    pub fn new(period: Duration, deadline: Duration, execution: Duration, wcet: Duration) -> Self {
        Self {
            period_us: duration_us(period),
            deadline_us: duration_us(deadline),
            execution_us: duration_us(execution),
            wcet_us: duration_us(wcet),
        }
    }

    /// Period and relative deadline in milliseconds; execution estimates zero
    pub fn from_millis(period_ms: u64, deadline_ms: u64) -> Self {
        Self {
            period_us: period_ms * 1000,
            deadline_us: deadline_ms * 1000,
            execution_us: 0,
            wcet_us: 0,
        }
    }

    pub fn with_execution(mut self, execution: Duration) -> Self {
        self.execution_us = duration_us(execution);
        self
    }

    pub fn with_wcet(mut self, wcet: Duration) -> Self {
        self.wcet_us = duration_us(wcet);
        self
    }
}

impl Default for TaskTiming {
    fn default() -> Self {
        Self {
            period_us: 1_000_000,
            deadline_us: 1_000_000,
            execution_us: 10_000,
            wcet_us: 50_000,
        }
    }
}

/// Task descriptor
///
/// Owned by the scheduler's registry after submission. Every change of
/// `state` goes through `set_state`, which counts the context switch and
/// queues the transition for the scheduler to publish.
pub struct TaskDescriptor {
    id: TaskId,
    name: String,
    priority: TaskPriority,
    kind: TaskKind,
    timing: TaskTiming,
    state: TaskState,
    next_release_us: u64,
    deadline_us: u64,
    enabled: bool,
    delete_requested: bool,
    /// Aperiodic tasks wait for a trigger after each run
    armed: bool,
    /// Sleep requested while running, applied after the closure returns
    pending_sleep_until: Option<u64>,
    /// Trigger received while running, applied after re-arming
    pending_trigger_us: Option<u64>,
    last_dispatch_us: Option<u64>,
    work: Option<TaskFn>,
    stats: TaskStatistics,
    transitions: Vec<(TaskState, TaskState)>,
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("next_release_us", &self.next_release_us)
            .field("deadline_us", &self.deadline_us)
            .finish_non_exhaustive()
    }
}

/// Builder for `TaskDescriptor`
pub struct TaskBuilder {
    name: String,
    priority: TaskPriority,
    kind: TaskKind,
    timing: TaskTiming,
    work: Option<TaskFn>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: TaskPriority::default(),
            kind: TaskKind::Periodic,
            timing: TaskTiming::default(),
            work: None,
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn timing(mut self, timing: TaskTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Infallible work closure
    pub fn work<F>(mut self, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.work = Some(Box::new(move || {
            f();
            Ok(())
        }));
        self
    }

    /// Work closure that may report an error
    pub fn try_work<F>(mut self, f: F) -> Self
    where
        F: FnMut() -> Result<(), WorkError> + Send + 'static,
    {
        self.work = Some(Box::new(f));
        self
    }

    /// Build a READY descriptor released at `now_us`
    pub fn build(self, id: TaskId, now_us: u64) -> Result<TaskDescriptor, SchedulerError> {
        if self.kind == TaskKind::Periodic && self.timing.period_us == 0 {
            return Err(SchedulerError::InvalidTiming("periodic task needs a non-zero period"));
        }
        if self.kind == (TaskKind::Sporadic { min_interarrival_us: 0 }) {
            return Err(SchedulerError::InvalidTiming(
                "sporadic task needs a non-zero minimum inter-arrival time",
            ));
        }
        let work = self.work.unwrap_or_else(|| Box::new(|| Ok(())));
        Ok(TaskDescriptor {
            id,
            name: self.name,
            priority: self.priority,
            kind: self.kind,
            timing: self.timing,
            state: TaskState::Ready,
            next_release_us: now_us,
            deadline_us: Deadline::new(now_us, self.timing.deadline_us).at(),
            enabled: true,
            delete_requested: false,
            armed: true,
            pending_sleep_until: None,
            pending_trigger_us: None,
            last_dispatch_us: None,
            work: Some(work),
            stats: TaskStatistics::new(now_us),
            transitions: Vec::new(),
        })
    }
}

/// How a dispatch ended, as seen by the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    pub missed_deadline: bool,
    pub deadline_us: u64,
    /// How far past the deadline the job finished (0 if met)
    pub lateness_us: u64,
    pub terminated: bool,
}

impl TaskDescriptor {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn timing(&self) -> TaskTiming {
        self.timing
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Earliest time the current job may run
    pub fn next_release_us(&self) -> u64 {
        self.next_release_us
    }

    /// Absolute deadline of the current job
    pub fn deadline_us(&self) -> u64 {
        self.deadline_us
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_delete_requested(&self) -> bool {
        self.delete_requested
    }

    /// False for an aperiodic task waiting for its next trigger
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn statistics(&self) -> &TaskStatistics {
        &self.stats
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TaskState::Terminated
    }

    /// Frequency in Hz (periodic tasks)
    pub fn frequency_hz(&self) -> f64 {
        if self.kind != TaskKind::Periodic || self.timing.period_us == 0 {
            0.0
        } else {
            1_000_000.0 / self.timing.period_us as f64
        }
    }

    /// Planned CPU utilization, WCET / period (periodic tasks)
    pub fn utilization(&self) -> f64 {
        if self.kind != TaskKind::Periodic || self.timing.period_us == 0 {
            0.0
        } else {
            self.timing.wcet_us as f64 / self.timing.period_us as f64
        }
    }

    /// Observed CPU utilization in percent
    pub fn cpu_utilization(&self) -> f64 {
        if self.kind != TaskKind::Periodic {
            return 0.0;
        }
        self.stats.cpu_utilization(self.timing.period_us)
    }

    /// Has the current job's deadline passed at `now_us`?
    pub fn has_deadline_passed(&self, now_us: u64) -> bool {
        !self.job_deadline().is_met(now_us)
    }

    /// Deadline of the current job
    pub fn job_deadline(&self) -> Deadline {
        Deadline::new(self.next_release_us, self.timing.deadline_us)
    }

    /// READY, enabled, armed and released by `now_us`
    pub fn is_eligible(&self, now_us: u64) -> bool {
        self.enabled
            && self.armed
            && self.state == TaskState::Ready
            && self.next_release_us <= now_us
    }

    /// Release time the loop may wait for, if the task can become eligible
    /// without outside help
    pub fn pending_release_us(&self) -> Option<u64> {
        if !self.enabled || !self.armed {
            return None;
        }
        match self.state {
            TaskState::Ready | TaskState::Sleeping | TaskState::Blocked => {
                Some(self.next_release_us)
            }
            TaskState::Running | TaskState::Suspended | TaskState::Terminated => None,
        }
    }

    /// Selection key: priority, then release time, then id
    pub(crate) fn selection_key(&self) -> (TaskPriority, u64, TaskId) {
        (self.priority, self.next_release_us, self.id)
    }

    pub fn set_priority(&mut self, priority: TaskPriority) -> Result<(), SchedulerError> {
        if self.state == TaskState::Running {
            return Err(SchedulerError::InvalidPriorityChangeWhileRunning(self.id));
        }
        self.priority = priority;
        Ok(())
    }

    /// Change the period; the current release time anchors the new grid
    pub fn set_period(&mut self, period: Duration) -> Result<(), SchedulerError> {
        if self.kind != TaskKind::Periodic {
            return Err(SchedulerError::InvalidPeriodOnNonPeriodicTask(self.id));
        }
        self.reject_while_running("set period of")?;
        let period_us = duration_us(period);
        if period_us == 0 {
            return Err(SchedulerError::InvalidTiming("periodic task needs a non-zero period"));
        }
        self.timing.period_us = period_us;
        Ok(())
    }

    pub fn set_deadline(&mut self, deadline: Duration) -> Result<(), SchedulerError> {
        self.reject_while_running("set deadline of")?;
        self.timing.deadline_us = duration_us(deadline);
        self.refresh_deadline();
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            TaskState::Running | TaskState::Terminated => Err(self.invalid("suspend")),
            TaskState::Suspended => Ok(()),
            _ => {
                self.set_state(TaskState::Suspended);
                Ok(())
            }
        }
    }

    /// Resume a suspended task. Periodic tasks rejoin their phase grid at the
    /// first release not before `now_us`.
    pub fn resume(&mut self, now_us: u64) -> Result<(), SchedulerError> {
        if self.state != TaskState::Suspended {
            return Err(self.invalid("resume"));
        }
        if self.kind == TaskKind::Periodic && self.next_release_us < now_us {
            let period = self.timing.period_us;
            let behind = now_us - self.next_release_us;
            let steps = behind.div_ceil(period);
            self.set_release(self.next_release_us.saturating_add(steps.saturating_mul(period)));
        }
        self.set_state(TaskState::Ready);
        Ok(())
    }

    /// Terminate the task. A running task is only flagged; returns whether
    /// the task is TERMINATED now.
    pub fn terminate(&mut self) -> bool {
        self.delete_requested = true;
        match self.state {
            TaskState::Running => false,
            TaskState::Terminated => true,
            _ => {
                self.enabled = false;
                self.set_state(TaskState::Terminated);
                true
            }
        }
    }

    /// Flag for removal at the next safe point
    pub(crate) fn request_delete(&mut self) {
        self.delete_requested = true;
    }

    /// Sleep for `duration` from `now_us`. A running task sleeps once its
    /// work closure returns.
    pub fn sleep(&mut self, now_us: u64, duration: Duration) -> Result<(), SchedulerError> {
        let until = now_us.saturating_add(duration_us(duration));
        match self.state {
            TaskState::Terminated | TaskState::Suspended => Err(self.invalid("sleep")),
            TaskState::Running => {
                self.pending_sleep_until = Some(until);
                Ok(())
            }
            _ => {
                self.set_release(until);
                self.armed = true;
                self.set_state(TaskState::Sleeping);
                Ok(())
            }
        }
    }

    /// External release of an aperiodic or sporadic task at `at_us`
    pub fn trigger(&mut self, at_us: u64) -> Result<(), SchedulerError> {
        let at = match self.kind {
            TaskKind::Aperiodic => at_us,
            TaskKind::Sporadic { min_interarrival_us } => match self.last_dispatch_us {
                Some(last) => at_us.max(last.saturating_add(min_interarrival_us)),
                None => at_us,
            },
            TaskKind::Periodic | TaskKind::OneShot => return Err(self.invalid("trigger")),
        };
        match self.state {
            TaskState::Terminated => Err(self.invalid("trigger")),
            TaskState::Running => {
                self.pending_trigger_us = Some(at);
                Ok(())
            }
            _ => {
                self.set_release(at);
                self.armed = true;
                Ok(())
            }
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn reset_statistics(&mut self, now_us: u64) {
        self.stats.reset(now_us);
    }

    /// SLEEPING or BLOCKED tasks whose release time has come return to READY
    pub(crate) fn promote(&mut self, now_us: u64) -> bool {
        let waiting = matches!(self.state, TaskState::Sleeping | TaskState::Blocked);
        if waiting && self.enabled && self.next_release_us <= now_us {
            self.set_state(TaskState::Ready);
            true
        } else {
            false
        }
    }

    /// Move to RUNNING and hand the work closure to the dispatcher
    pub(crate) fn begin_dispatch(&mut self, now_us: u64) -> TaskFn {
        self.set_state(TaskState::Running);
        self.last_dispatch_us = Some(now_us);
        self.stats.last_execution_us = now_us;
        self.work.take().unwrap_or_else(|| Box::new(|| Ok(())))
    }

    /// Take back the closure, fold in statistics, check the deadline and
    /// re-arm according to kind, failure policy and pending requests.
    pub(crate) fn finish_dispatch(
        &mut self,
        work: TaskFn,
        started_us: u64,
        finished_us: u64,
        failed: bool,
        policy: FailurePolicy,
    ) -> Completion {
        self.work = Some(work);
        self.stats.record_execution(started_us, finished_us);
        if failed {
            self.stats.failures += 1;
        }

        let job = self.job_deadline();
        let missed_deadline = !job.is_met(finished_us);
        if missed_deadline {
            self.stats.missed_deadlines += 1;
        }

        let pending_sleep = self.pending_sleep_until.take();
        let pending_trigger = self.pending_trigger_us.take();
        let terminate = self.delete_requested
            || (failed && policy == FailurePolicy::Terminate)
            || self.kind == TaskKind::OneShot;

        if terminate {
            self.enabled = false;
            self.set_state(TaskState::Terminated);
        } else if let Some(until) = pending_sleep {
            self.set_release(until);
            let state = if until <= finished_us {
                TaskState::Ready
            } else {
                TaskState::Sleeping
            };
            self.set_state(state);
        } else {
            self.rearm(started_us, finished_us);
            if let Some(at_us) = pending_trigger {
                self.retrigger(at_us, finished_us);
            }
        }

        Completion {
            missed_deadline,
            deadline_us: job.at(),
            lateness_us: job.lateness(finished_us),
            terminated: terminate,
        }
    }

    fn rearm(&mut self, started_us: u64, finished_us: u64) {
        match self.kind {
            TaskKind::Periodic => {
                let period = self.timing.period_us;
                let next = if finished_us >= self.next_release_us {
                    let steps = (finished_us - self.next_release_us) / period + 1;
                    self.next_release_us.saturating_add(steps.saturating_mul(period))
                } else {
                    self.next_release_us.saturating_add(period)
                };
                self.set_release(next);
                self.set_state(TaskState::Ready);
            }
            TaskKind::Sporadic { min_interarrival_us } => {
                self.set_release(started_us.saturating_add(min_interarrival_us));
                if self.next_release_us <= finished_us {
                    self.set_state(TaskState::Ready);
                } else {
                    self.set_state(TaskState::Blocked);
                }
            }
            TaskKind::Aperiodic => {
                self.armed = false;
                self.set_state(TaskState::Ready);
            }
            TaskKind::OneShot => self.set_state(TaskState::Terminated),
        }
    }

    /// Re-arm from a trigger that arrived during the dispatch
    fn retrigger(&mut self, at_us: u64, finished_us: u64) {
        match self.kind {
            TaskKind::Aperiodic => self.set_release(at_us),
            TaskKind::Sporadic { .. } => {
                self.set_release(at_us.max(self.next_release_us));
                if self.next_release_us <= finished_us {
                    self.set_state(TaskState::Ready);
                } else {
                    self.set_state(TaskState::Blocked);
                }
            }
            TaskKind::Periodic | TaskKind::OneShot => return,
        }
        self.armed = true;
    }

    fn set_release(&mut self, release_us: u64) {
        self.next_release_us = release_us;
        self.refresh_deadline();
    }

    fn refresh_deadline(&mut self) {
        self.deadline_us = self.job_deadline().at();
    }

    pub(crate) fn set_state(&mut self, to: TaskState) {
        let from = self.state;
        if from != to {
            self.state = to;
            self.stats.context_switches += 1;
            self.transitions.push((from, to));
        }
    }

    /// Transitions since the last call, oldest first
    pub(crate) fn take_transitions(&mut self) -> Vec<(TaskState, TaskState)> {
        core::mem::take(&mut self.transitions)
    }

    fn reject_while_running(&self, op: &'static str) -> Result<(), SchedulerError> {
        if self.state == TaskState::Running {
            Err(self.invalid(op))
        } else {
            Ok(())
        }
    }

    fn invalid(&self, op: &'static str) -> SchedulerError {
        SchedulerError::InvalidStateTransition {
            id: self.id,
            state: self.state,
            op,
        }
    }

    /// Point-in-time copy for status reporting
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            kind: self.kind,
            state: self.state,
            timing: self.timing,
            next_release_us: self.next_release_us,
            deadline_us: self.deadline_us,
            enabled: self.enabled,
            delete_requested: self.delete_requested,
            statistics: self.stats,
        }
    }
}

/// Copy of a task's externally visible state
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub priority: TaskPriority,
    pub kind: TaskKind,
    pub state: TaskState,
    pub timing: TaskTiming,
    pub next_release_us: u64,
    pub deadline_us: u64,
    pub enabled: bool,
    pub delete_requested: bool,
    pub statistics: TaskStatistics,
}

impl TaskSnapshot {
    /// One-line status for console reporting
    pub fn status_line(&self) -> String {
        format!(
            "[{}] {} {} {} prio={} runs={} missed={} avg={:.1}us",
            self.id,
            self.name,
            self.kind,
            self.state,
            self.priority,
            self.statistics.executions,
            self.statistics.missed_deadlines,
            self.statistics.average_execution_us(),
        )
    }
}
