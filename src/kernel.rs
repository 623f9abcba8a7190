//! Kernel — top-level manager
//!
//! Binds a clock to a scheduler. `Kernel::testing()` runs on the simulated
//! `SysTimer` so whole schedules replay deterministically; `Kernel::realtime()`
//! follows wall time and can host the dispatch loop on its own thread.
//!
//! Author: Moroya Sakamoto

use core::time::Duration;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::scheduler::Scheduler;
use crate::task::{TaskBuilder, TaskId};
use crate::timer::{duration_us, MonotonicClock, SysTimer};

/// Kernel
pub struct Kernel {
    scheduler: Arc<Scheduler>,
    /// Present when running on simulated time
    timer: Option<SysTimer>,
}

impl Kernel {
    /// Kernel on wall-clock time
    pub fn realtime() -> Self {
        Self::realtime_with_config(SchedulerConfig::default())
    }

    pub fn realtime_with_config(config: SchedulerConfig) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::with_config(Arc::new(MonotonicClock::new()), config)),
            timer: None,
        }
    }

    /// Kernel for testing (software timer at t = 0)
    pub fn testing() -> Self {
        Self::testing_with_config(SchedulerConfig::default())
    }

    pub fn testing_with_config(config: SchedulerConfig) -> Self {
        let timer = SysTimer::software();
        Self {
            scheduler: Arc::new(Scheduler::with_config(Arc::new(timer.clone()), config)),
            timer: Some(timer),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Simulated timer handle, for work closures that consume simulated time
    pub fn timer(&self) -> Option<&SysTimer> {
        self.timer.as_ref()
    }

    /// Register a task released now
    pub fn add_task(&self, builder: TaskBuilder) -> Result<TaskId, SchedulerError> {
        self.scheduler.spawn(builder)
    }

    /// Run the dispatch loop for `duration` of scheduler time
    pub fn run_for(&self, duration: Duration) -> KernelStats {
        let start = self.scheduler.now_us();
        let end = start.saturating_add(duration_us(duration));
        let before = self.scheduler.counters();
        let dispatches = self.scheduler.run(|_, now| now >= end);
        let after = self.scheduler.counters();

        KernelStats {
            elapsed_us: self.scheduler.now_us().saturating_sub(start),
            dispatches,
            missed_deadlines: after.total_missed_deadlines - before.total_missed_deadlines,
            failures: after.total_failures - before.total_failures,
            context_switches: after.total_context_switches - before.total_context_switches,
            active_tasks: after.active_tasks,
            utilization: self.scheduler.total_utilization(),
            schedulable: self.scheduler.is_schedulable(),
        }
    }

    /// Handle that stops a `run` loop from another thread
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    /// Run the dispatch loop on a background thread until stopped
    pub fn start(&self) -> std::io::Result<Dispatcher> {
        let scheduler = Arc::clone(&self.scheduler);
        let join = thread::Builder::new()
            .name("rt-dispatch".into())
            .spawn(move || scheduler.run(|_, _| false))?;
        Ok(Dispatcher {
            stop: self.stop_handle(),
            join,
        })
    }
}

/// Stops a dispatch loop
#[derive(Clone)]
pub struct StopHandle {
    scheduler: Arc<Scheduler>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

/// Dispatch loop running on its own thread
pub struct Dispatcher {
    stop: StopHandle,
    join: JoinHandle<u64>,
}

impl Dispatcher {
    /// Stop the loop and wait for it; returns the dispatch count
    pub fn stop(self) -> thread::Result<u64> {
        self.stop.stop();
        self.join.join()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Kernel execution statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelStats {
    /// Elapsed scheduler time (µs)
    pub elapsed_us: u64,
    /// Work closures dispatched
    pub dispatches: u64,
    pub missed_deadlines: u64,
    pub failures: u64,
    pub context_switches: u64,
    pub active_tasks: usize,
    /// Planned CPU utilization
    pub utilization: f64,
    /// RMS schedulable
    pub schedulable: bool,
}
