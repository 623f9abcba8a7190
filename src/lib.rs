//! ALICE-RTsim — Real-time scheduling on a single logical timeline
//!
//! Tasks with priorities, periods, deadlines and execution budgets,
//! dispatched one at a time by a fixed-priority loop:
//! - Lower priority value runs first; ties by release time, then id
//! - Periodic tasks re-arm on a fixed phase grid (no drift)
//! - Deadline misses are detected post-hoc and counted, never fatal
//! - Work closure failures are caught at the dispatch boundary
//! - External threads query and control tasks through the scheduler lock
//!
//! Author: Moroya Sakamoto

pub mod config;
pub mod error;
pub mod event;
pub mod failure;
pub mod kernel;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod timer;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, WorkError};
pub use event::SchedulerEvent;
pub use failure::{FailureCause, FailureLog, FailurePolicy, FailureSink, TaskFailure};
pub use kernel::{Dispatcher, Kernel, KernelStats, StopHandle};
pub use scheduler::{Dispatch, DispatchReport, IdAllocator, RemoveOutcome, Scheduler};
pub use stats::{SchedulerCounters, TaskStatistics};
pub use task::{
    TaskBuilder, TaskDescriptor, TaskFn, TaskId, TaskKind, TaskPriority, TaskSnapshot, TaskState,
    TaskTiming,
};
pub use timer::{Clock, Deadline, MonotonicClock, SysTimer, WakeSignal};
