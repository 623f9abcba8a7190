//! Fixed-priority dispatch loop
//!
//! One logical executor: each `run_once` promotes tasks whose release time
//! has come, picks the eligible task with the numerically lowest priority
//! (ties: earliest release, then lowest id), runs its work closure outside
//! the registry lock, then folds the result back in and re-arms the task.
//!
//! ```text
//!   external threads ──► submit / remove / suspend / resume / set_*  ──┐
//!                                                                      ▼
//!                                              Mutex<Registry> ◄── run_once
//!                                                   │   (select, transition)
//!                         WakeSignal ◄── mutators   │
//!                             │                     ▼
//!                      run: sleep_until ◄── Idle   work closure (no lock held)
//! ```
//!
//! Author: Moroya Sakamoto

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::event::{EventQueue, SchedulerEvent};
use crate::failure::{FailureCause, FailureLog, FailureSink, TaskFailure};
use crate::stats::{SchedulerCounters, TaskStatistics};
use crate::task::{
    TaskBuilder, TaskDescriptor, TaskId, TaskKind, TaskPriority, TaskSnapshot, TaskState,
};
use crate::timer::{duration_us, Clock, WakeSignal};

/// Event handler invoked by the dispatch loop
pub type EventHandler = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

/// Hands out task ids; ids are never reused
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn allocate(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure an externally chosen id is never handed out later
    pub fn observe(&self, id: TaskId) {
        self.next.fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one dispatch decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A task ran
    Dispatched(DispatchReport),
    /// Nothing eligible; the earliest release the loop may wait for
    Idle { next_release_us: Option<u64> },
    /// Another caller is already executing a task
    Busy(TaskId),
}

impl Dispatch {
    /// Task that ran, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Dispatch::Dispatched(report) => Some(report.id),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Dispatch::Idle { .. })
    }
}

/// What happened during one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub id: TaskId,
    pub started_us: u64,
    pub finished_us: u64,
    pub missed_deadline: bool,
    pub failed: bool,
    /// State after re-arming
    pub state: TaskState,
    /// Removed from the registry at this safe point
    pub removed: bool,
}

/// Outcome of `remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Task was running; it is removed after its work closure returns
    Deferred,
}

#[derive(Default)]
struct Registry {
    tasks: BTreeMap<TaskId, TaskDescriptor>,
    running: Option<TaskId>,
    counters: SchedulerCounters,
}

/// Move a task's pending transitions into the counters and event queue
fn publish(task: &mut TaskDescriptor, counters: &mut SchedulerCounters, events: &EventQueue) {
    for (from, to) in task.take_transitions() {
        counters.total_context_switches += 1;
        events.push(SchedulerEvent::StateChanged {
            id: task.id(),
            from,
            to,
        });
    }
}

/// Real-time task scheduler
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct Scheduler {
    registry: Mutex<Registry>,
    clock: Arc<dyn Clock>,
    wake: WakeSignal,
    events: EventQueue,
    handlers: Mutex<Vec<EventHandler>>,
    failure_sink: Arc<dyn FailureSink>,
    failure_log: Option<Arc<FailureLog>>,
    ids: IdAllocator,
    config: SchedulerConfig,
    stop: AtomicBool,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, SchedulerConfig::default())
    }

    pub fn with_config(clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        let log = Arc::new(FailureLog::new(config.failure_log_capacity));
        Self {
            registry: Mutex::new(Registry::default()),
            clock,
            wake: WakeSignal::new(),
            events: EventQueue::new(config.event_capacity),
            handlers: Mutex::new(Vec::new()),
            failure_sink: log.clone(),
            failure_log: Some(log),
            ids: IdAllocator::new(),
            config,
            stop: AtomicBool::new(false),
        }
    }

    /// Replace the default failure log with a custom sink
    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.failure_sink = sink;
        self.failure_log = None;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time on the scheduler's clock
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Default failure sink, unless replaced
    pub fn failure_log(&self) -> Option<&FailureLog> {
        self.failure_log.as_deref()
    }

    pub fn allocate_id(&self) -> TaskId {
        self.ids.allocate()
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Register a READY descriptor
    pub fn submit(&self, task: TaskDescriptor) -> Result<TaskId, SchedulerError> {
        let id = task.id();
        if task.state() != TaskState::Ready {
            return Err(SchedulerError::InvalidStateTransition {
                id,
                state: task.state(),
                op: "submit",
            });
        }
        {
            let mut reg = self.registry.lock();
            if reg.tasks.contains_key(&id) {
                log::warn!("rejected duplicate task id {id}");
                return Err(SchedulerError::DuplicateTaskId(id));
            }
            if reg.tasks.len() >= self.config.max_tasks {
                return Err(SchedulerError::RegistryFull {
                    capacity: self.config.max_tasks,
                });
            }
            self.ids.observe(id);
            log::info!(
                "task '{}' (id {id}, {} priority {}) submitted",
                task.name(),
                task.kind(),
                task.priority()
            );
            reg.tasks.insert(id, task);
        }
        self.events.push(SchedulerEvent::Submitted { id });
        self.wake.notify();
        Ok(id)
    }

    /// Build a task with a freshly allocated id, released now, and submit it
    pub fn spawn(&self, builder: TaskBuilder) -> Result<TaskId, SchedulerError> {
        let id = self.ids.allocate();
        let task = builder.build(id, self.clock.now_us())?;
        self.submit(task)
    }

    /// Remove a task. A running task is flagged and removed at the next
    /// safe point.
    pub fn remove(&self, id: TaskId) -> Result<RemoveOutcome, SchedulerError> {
        let mut reg = self.registry.lock();
        let task = reg.tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))?;
        if task.state() == TaskState::Running {
            task.request_delete();
            log::info!("task '{}' (id {id}) running, removal deferred", task.name());
            return Ok(RemoveOutcome::Deferred);
        }
        if let Some(task) = reg.tasks.remove(&id) {
            log::info!("task '{}' (id {id}) removed", task.name());
        }
        drop(reg);
        self.events.push(SchedulerEvent::Removed { id });
        Ok(RemoveOutcome::Removed)
    }

    /// Apply a validated mutation under the registry lock
    fn update<R>(
        &self,
        id: TaskId,
        op: &'static str,
        f: impl FnOnce(&mut TaskDescriptor, u64) -> Result<R, SchedulerError>,
    ) -> Result<R, SchedulerError> {
        let now = self.clock.now_us();
        let result = {
            let mut reg = self.registry.lock();
            let Registry { tasks, counters, .. } = &mut *reg;
            let task = tasks.get_mut(&id).ok_or(SchedulerError::TaskNotFound(id))?;
            let result = f(task, now);
            publish(task, counters, &self.events);
            result
        };
        match &result {
            Ok(_) => {
                log::debug!("{op} task {id}");
                self.wake.notify();
            }
            Err(e) => log::warn!("{op} task {id} rejected: {e}"),
        }
        result
    }

    pub fn suspend(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.update(id, "suspend", |task, _| task.suspend())
    }

    pub fn resume(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.update(id, "resume", |task, now| task.resume(now))
    }

    /// Terminate a task; returns whether it is TERMINATED now (false when
    /// deferred because it is running)
    pub fn terminate(&self, id: TaskId) -> Result<bool, SchedulerError> {
        self.update(id, "terminate", |task, _| Ok(task.terminate()))
    }

    pub fn sleep(&self, id: TaskId, duration: Duration) -> Result<(), SchedulerError> {
        self.update(id, "sleep", |task, now| task.sleep(now, duration))
    }

    pub fn set_priority(&self, id: TaskId, priority: TaskPriority) -> Result<(), SchedulerError> {
        self.update(id, "set priority of", |task, _| task.set_priority(priority))
    }

    pub fn set_period(&self, id: TaskId, period: Duration) -> Result<(), SchedulerError> {
        self.update(id, "set period of", |task, _| task.set_period(period))
    }

    pub fn set_deadline(&self, id: TaskId, deadline: Duration) -> Result<(), SchedulerError> {
        self.update(id, "set deadline of", |task, _| task.set_deadline(deadline))
    }

    pub fn set_enabled(&self, id: TaskId, enabled: bool) -> Result<(), SchedulerError> {
        self.update(id, "enable/disable", |task, _| {
            task.set_enabled(enabled);
            Ok(())
        })
    }

    /// Release an aperiodic or sporadic task at `at_us`
    pub fn trigger(&self, id: TaskId, at_us: u64) -> Result<(), SchedulerError> {
        self.update(id, "trigger", |task, _| task.trigger(at_us))
    }

    /// Release an aperiodic or sporadic task now
    pub fn trigger_now(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.update(id, "trigger", |task, now| task.trigger(now))
    }

    pub fn reset_statistics(&self, id: TaskId) -> Result<(), SchedulerError> {
        self.update(id, "reset statistics of", |task, now| {
            task.reset_statistics(now);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn statistics(&self, id: TaskId) -> Result<TaskStatistics, SchedulerError> {
        let reg = self.registry.lock();
        reg.tasks
            .get(&id)
            .map(|t| *t.statistics())
            .ok_or(SchedulerError::TaskNotFound(id))
    }

    pub fn state(&self, id: TaskId) -> Result<TaskState, SchedulerError> {
        let reg = self.registry.lock();
        reg.tasks.get(&id).map(|t| t.state()).ok_or(SchedulerError::TaskNotFound(id))
    }

    pub fn snapshot(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        let reg = self.registry.lock();
        reg.tasks.get(&id).map(|t| t.snapshot()).ok_or(SchedulerError::TaskNotFound(id))
    }

    /// Snapshots of all registered tasks, by ascending id
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.registry.lock().tasks.values().map(|t| t.snapshot()).collect()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.registry.lock().tasks.contains_key(&id)
    }

    pub fn task_count(&self) -> usize {
        self.registry.lock().tasks.len()
    }

    /// Number of registered, non-terminated tasks
    pub fn active_task_count(&self) -> usize {
        self.registry.lock().tasks.values().filter(|t| !t.is_terminated()).count()
    }

    /// Task currently executing, if any
    pub fn running_task(&self) -> Option<TaskId> {
        self.registry.lock().running
    }

    pub fn counters(&self) -> SchedulerCounters {
        let reg = self.registry.lock();
        SchedulerCounters {
            active_tasks: reg.tasks.values().filter(|t| !t.is_terminated()).count(),
            dropped_events: self.events.dropped(),
            ..reg.counters
        }
    }

    // ------------------------------------------------------------------
    // Schedulability
    // ------------------------------------------------------------------

    /// Planned utilization Σ WCET/period over periodic, non-terminated tasks
    pub fn total_utilization(&self) -> f64 {
        utilization_of(&self.registry.lock().tasks)
    }

    /// Rate-monotonic test against the Liu & Layland bound
    pub fn is_schedulable(&self) -> bool {
        let reg = self.registry.lock();
        let n = reg
            .tasks
            .values()
            .filter(|t| !t.is_terminated() && t.kind() == TaskKind::Periodic)
            .count();
        if n == 0 {
            return true;
        }
        utilization_of(&reg.tasks) <= liu_layland_bound(n)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Register a handler; the dispatch loop delivers queued events to it
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.handlers.lock().push(Arc::new(handler));
    }

    /// Take all queued events (for callers without a subscription)
    pub fn take_events(&self) -> Vec<SchedulerEvent> {
        self.events.drain()
    }

    /// Deliver queued events to subscribers. Handler panics are recorded in
    /// the failure sink. Returns the number of events delivered.
    pub fn deliver_events(&self) -> usize {
        let handlers: Vec<EventHandler> = self.handlers.lock().clone();
        if handlers.is_empty() {
            return 0;
        }
        let events = self.events.drain();
        for event in &events {
            for handler in &handlers {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                    let id = event.task_id();
                    let name = self
                        .registry
                        .lock()
                        .tasks
                        .get(&id)
                        .map(|t| t.name().to_string())
                        .unwrap_or_default();
                    let cause = FailureCause::from_panic(payload.as_ref());
                    self.failure_sink.record(TaskFailure {
                        id,
                        name,
                        at_us: self.clock.now_us(),
                        cause: FailureCause::Handler(cause.message().to_string()),
                    });
                }
            }
        }
        events.len()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Make exactly one dispatch decision at `now_us`
    pub fn run_once(&self, now_us: u64) -> Dispatch {
        let dispatch = self.dispatch_at(now_us);
        self.deliver_events();
        dispatch
    }

    fn dispatch_at(&self, now_us: u64) -> Dispatch {
        let (id, name, mut work) = {
            let mut reg = self.registry.lock();
            if let Some(running) = reg.running {
                return Dispatch::Busy(running);
            }
            let Registry { tasks, counters, running } = &mut *reg;

            for task in tasks.values_mut() {
                task.promote(now_us);
                publish(task, counters, &self.events);
            }

            let chosen = tasks
                .values()
                .filter(|t| t.is_eligible(now_us))
                .min_by_key(|t| t.selection_key())
                .map(|t| t.id());

            let Some(chosen) = chosen else {
                counters.idle_decisions += 1;
                let next_release_us = tasks.values().filter_map(|t| t.pending_release_us()).min();
                log::trace!("idle at {now_us}us, next release {next_release_us:?}");
                return Dispatch::Idle { next_release_us };
            };
            let Some(task) = tasks.get_mut(&chosen) else {
                return Dispatch::Idle { next_release_us: None };
            };

            let work = task.begin_dispatch(now_us);
            publish(task, counters, &self.events);
            counters.total_dispatches += 1;
            *running = Some(task.id());
            (task.id(), task.name().to_string(), work)
        };

        log::debug!("dispatch '{name}' (id {id}) at {now_us}us");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work()));
        let finished_us = self.clock.now_us().max(now_us);
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(FailureCause::Error(e.to_string())),
            Err(payload) => Some(FailureCause::from_panic(payload.as_ref())),
        };

        let (completion, state, removed) = {
            let mut reg = self.registry.lock();
            let Registry { tasks, counters, running } = &mut *reg;
            *running = None;
            let Some(task) = tasks.get_mut(&id) else {
                // Registry was cleared underneath us; nothing to re-arm.
                return Dispatch::Dispatched(DispatchReport {
                    id,
                    started_us: now_us,
                    finished_us,
                    missed_deadline: false,
                    failed: failure.is_some(),
                    state: TaskState::Terminated,
                    removed: true,
                });
            };
            let completion = task.finish_dispatch(
                work,
                now_us,
                finished_us,
                failure.is_some(),
                self.config.failure_policy,
            );
            publish(task, counters, &self.events);
            let state = task.state();
            let removed = task.is_delete_requested() && task.is_terminated();
            if completion.missed_deadline {
                counters.total_missed_deadlines += 1;
            }
            if failure.is_some() {
                counters.total_failures += 1;
            }
            if removed {
                tasks.remove(&id);
            }
            (completion, state, removed)
        };

        if completion.missed_deadline {
            log::warn!(
                "task '{name}' (id {id}) missed deadline {}us by {}us",
                completion.deadline_us,
                completion.lateness_us
            );
            self.events.push(SchedulerEvent::DeadlineMissed {
                id,
                deadline_us: completion.deadline_us,
                finished_us,
            });
        }
        if let Some(cause) = &failure {
            let reason = cause.to_string();
            self.failure_sink.record(TaskFailure {
                id,
                name: name.clone(),
                at_us: finished_us,
                cause: cause.clone(),
            });
            self.events.push(SchedulerEvent::TaskFailed {
                id,
                reason,
                terminated: completion.terminated,
            });
        }
        if removed {
            log::info!("task '{name}' (id {id}) removed after deferred delete");
            self.events.push(SchedulerEvent::Removed { id });
        }

        Dispatch::Dispatched(DispatchReport {
            id,
            started_us: now_us,
            finished_us,
            missed_deadline: completion.missed_deadline,
            failed: failure.is_some(),
            state,
            removed,
        })
    }

    /// Drive `run_once` until `should_stop` returns true or `stop` is
    /// called, sleeping until the next release between dispatches.
    /// Returns the number of dispatches made.
    pub fn run<F>(&self, mut should_stop: F) -> u64
    where
        F: FnMut(&Scheduler, u64) -> bool,
    {
        let idle_us = duration_us(self.config.idle_timeout).max(1);
        let mut dispatched = 0u64;
        loop {
            let now = self.clock.now_us();
            if self.stop.swap(false, Ordering::AcqRel) || should_stop(self, now) {
                break;
            }
            match self.run_once(now) {
                Dispatch::Dispatched(_) => dispatched += 1,
                Dispatch::Idle { next_release_us } => {
                    let cap = now.saturating_add(idle_us);
                    let until = next_release_us.map_or(cap, |t| t.min(cap));
                    self.clock.sleep_until(until, &self.wake);
                }
                Dispatch::Busy(_) => {
                    self.clock.sleep_until(now.saturating_add(idle_us), &self.wake);
                }
            }
        }
        log::info!("dispatch loop stopped after {dispatched} dispatches");
        dispatched
    }

    /// Ask a running `run` loop to return
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify();
    }

    /// Wake an idle `run` loop without changing any task
    pub fn wake(&self) {
        self.wake.notify();
    }
}

fn utilization_of(tasks: &BTreeMap<TaskId, TaskDescriptor>) -> f64 {
    tasks
        .values()
        .filter(|t| !t.is_terminated())
        .map(|t| t.utilization())
        .sum()
}

/// Liu & Layland bound: n(2^(1/n) - 1)
pub fn liu_layland_bound(n: usize) -> f64 {
    if n == 0 {
        return 1.0;
    }
    let n = n as f64;
    n * (2f64.powf(1.0 / n) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailurePolicy;
    use crate::task::TaskTiming;
    use crate::timer::SysTimer;
    use proptest::prelude::*;

    fn setup() -> (SysTimer, Scheduler) {
        let timer = SysTimer::software();
        let sched = Scheduler::new(Arc::new(timer.clone()));
        (timer, sched)
    }

    fn periodic(name: &str, prio: TaskPriority, period_ms: u64, deadline_ms: u64) -> TaskBuilder {
        TaskBuilder::new(name)
            .priority(prio)
            .timing(TaskTiming::from_millis(period_ms, deadline_ms))
    }

    #[test]
    fn test_scheduler_empty() {
        let (_, sched) = setup();
        assert_eq!(sched.active_task_count(), 0);
        assert!(sched.is_schedulable());
        assert_eq!(sched.run_once(0), Dispatch::Idle { next_release_us: None });
        assert_eq!(sched.counters().idle_decisions, 1);
    }

    #[test]
    fn test_submit_and_duplicate() {
        let (_, sched) = setup();
        let task = periodic("a", TaskPriority::HIGH, 100, 50).build(TaskId(5), 0).unwrap();
        assert_eq!(sched.submit(task), Ok(TaskId(5)));

        let dup = periodic("b", TaskPriority::LOW, 10, 10).build(TaskId(5), 0).unwrap();
        assert_eq!(sched.submit(dup), Err(SchedulerError::DuplicateTaskId(TaskId(5))));
        assert_eq!(sched.task_count(), 1);
        assert_eq!(sched.snapshot(TaskId(5)).unwrap().name, "a");
    }

    #[test]
    fn test_allocator_skips_submitted_ids() {
        let (_, sched) = setup();
        let task = periodic("a", TaskPriority::HIGH, 100, 50).build(TaskId(10), 0).unwrap();
        sched.submit(task).unwrap();
        let id = sched.spawn(periodic("b", TaskPriority::LOW, 100, 50)).unwrap();
        assert_eq!(id, TaskId(11));
    }

    #[test]
    fn test_registry_full() {
        let timer = SysTimer::software();
        let sched = Scheduler::with_config(
            Arc::new(timer),
            SchedulerConfig::default().with_max_tasks(1),
        );
        sched.spawn(periodic("a", TaskPriority::HIGH, 100, 50)).unwrap();
        assert_eq!(
            sched.spawn(periodic("b", TaskPriority::HIGH, 100, 50)),
            Err(SchedulerError::RegistryFull { capacity: 1 })
        );
    }

    #[test]
    fn test_remove_not_found() {
        let (_, sched) = setup();
        assert_eq!(sched.remove(TaskId(9)), Err(SchedulerError::TaskNotFound(TaskId(9))));
    }

    #[test]
    fn test_priority_order() {
        let (_, sched) = setup();
        let low = sched.spawn(periodic("low", TaskPriority::LOW, 1000, 100)).unwrap();
        let high = sched.spawn(periodic("high", TaskPriority::HIGH, 100, 50)).unwrap();

        assert_eq!(sched.run_once(0).task_id(), Some(high));
        assert_eq!(sched.run_once(0).task_id(), Some(low));
        assert!(sched.run_once(0).is_idle());
    }

    #[test]
    fn test_tie_break_by_release_then_id() {
        let (timer, sched) = setup();
        let late = periodic("late", TaskPriority::NORMAL, 100, 100).build(TaskId(1), 50).unwrap();
        let early = periodic("early", TaskPriority::NORMAL, 100, 100).build(TaskId(2), 10).unwrap();
        let same = periodic("same", TaskPriority::NORMAL, 100, 100).build(TaskId(3), 10).unwrap();
        sched.submit(late).unwrap();
        sched.submit(early).unwrap();
        sched.submit(same).unwrap();
        timer.advance(100);

        assert_eq!(sched.run_once(100).task_id(), Some(TaskId(2)));
        assert_eq!(sched.run_once(100).task_id(), Some(TaskId(3)));
        assert_eq!(sched.run_once(100).task_id(), Some(TaskId(1)));
    }

    #[test]
    fn test_periodic_execution() {
        let (timer, sched) = setup();
        let id = sched.spawn(periodic("p", TaskPriority::NORMAL, 100, 50)).unwrap();

        assert_eq!(sched.run_once(0).task_id(), Some(id));
        assert_eq!(sched.run_once(50_000), Dispatch::Idle { next_release_us: Some(100_000) });
        timer.advance_to(100_000);
        assert_eq!(sched.run_once(100_000).task_id(), Some(id));
        assert_eq!(sched.statistics(id).unwrap().executions, 2);
    }

    #[test]
    fn test_deadline_miss_rearms_periodic() {
        let (timer, sched) = setup();
        let clock = timer.clone();
        let id = sched
            .spawn(
                periodic("slow", TaskPriority::NORMAL, 100, 50)
                    .work(move || clock.delay_us(60_000)),
            )
            .unwrap();

        let Dispatch::Dispatched(report) = sched.run_once(0) else {
            panic!("expected dispatch");
        };
        assert!(report.missed_deadline);
        assert_eq!(report.finished_us, 60_000);
        assert_eq!(report.state, TaskState::Ready);

        let snap = sched.snapshot(id).unwrap();
        assert_eq!(snap.statistics.missed_deadlines, 1);
        assert_eq!(snap.next_release_us, 100_000);
        assert_eq!(sched.counters().total_missed_deadlines, 1);
        assert!(sched
            .take_events()
            .iter()
            .any(|e| matches!(e, SchedulerEvent::DeadlineMissed { deadline_us: 50_000, .. })));
    }

    #[test]
    fn test_work_error_terminates_by_default() {
        let (_, sched) = setup();
        let id = sched
            .spawn(
                periodic("bad", TaskPriority::NORMAL, 100, 50)
                    .try_work(|| Err("sensor offline".into())),
            )
            .unwrap();
        let other = sched.spawn(periodic("ok", TaskPriority::LOW, 100, 50)).unwrap();

        let Dispatch::Dispatched(report) = sched.run_once(0) else {
            panic!("expected dispatch");
        };
        assert!(report.failed);
        assert_eq!(sched.state(id), Ok(TaskState::Terminated));
        assert_eq!(sched.run_once(0).task_id(), Some(other));

        let log = sched.failure_log().unwrap();
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.records()[0].cause, FailureCause::Error("sensor offline".into()));
        assert_eq!(sched.counters().total_failures, 1);
        assert_eq!(sched.counters().active_tasks, 1);
    }

    #[test]
    fn test_panic_is_isolated_and_rearm_policy() {
        let timer = SysTimer::software();
        let sched = Scheduler::with_config(
            Arc::new(timer.clone()),
            SchedulerConfig::default().with_failure_policy(FailurePolicy::Rearm),
        );
        let id = sched
            .spawn(periodic("panicky", TaskPriority::NORMAL, 100, 50).work(|| panic!("overflow")))
            .unwrap();

        let report = sched.run_once(0);
        assert_eq!(report.task_id(), Some(id));
        assert_eq!(sched.state(id), Ok(TaskState::Ready));
        assert_eq!(sched.snapshot(id).unwrap().next_release_us, 100_000);
        assert!(sched.take_events().iter().any(|e| matches!(
            e,
            SchedulerEvent::TaskFailed { terminated: false, .. }
        )));
        assert_eq!(
            sched.failure_log().unwrap().records()[0].cause,
            FailureCause::Panic("overflow".into())
        );
    }

    #[test]
    fn test_suspend_resume() {
        let (timer, sched) = setup();
        let id = sched.spawn(periodic("test", TaskPriority::NORMAL, 100, 10)).unwrap();
        sched.suspend(id).unwrap();
        assert_eq!(sched.state(id), Ok(TaskState::Suspended));
        assert!(sched.run_once(0).is_idle());

        timer.advance_to(100_000);
        sched.resume(id).unwrap();
        assert_eq!(sched.run_once(100_000).task_id(), Some(id));
        // READY->SUSPENDED, SUSPENDED->READY, READY->RUNNING, RUNNING->READY
        assert_eq!(sched.statistics(id).unwrap().context_switches, 4);
        assert_eq!(sched.counters().total_context_switches, 4);
    }

    #[test]
    fn test_suspended_task_not_pending() {
        let (_, sched) = setup();
        let id = sched.spawn(periodic("s", TaskPriority::NORMAL, 100, 10)).unwrap();
        sched.suspend(id).unwrap();
        assert_eq!(sched.run_once(0), Dispatch::Idle { next_release_us: None });
    }

    #[test]
    fn test_sleep_via_scheduler() {
        let (timer, sched) = setup();
        let id = sched.spawn(periodic("z", TaskPriority::NORMAL, 100, 10)).unwrap();
        sched.sleep(id, Duration::from_millis(30)).unwrap();
        assert_eq!(sched.run_once(0), Dispatch::Idle { next_release_us: Some(30_000) });
        timer.advance_to(30_000);
        assert_eq!(sched.run_once(30_000).task_id(), Some(id));
    }

    #[test]
    fn test_oneshot_runs_once() {
        let (_, sched) = setup();
        let id = sched.spawn(TaskBuilder::new("init").kind(TaskKind::OneShot)).unwrap();
        assert_eq!(sched.run_once(0).task_id(), Some(id));
        assert!(sched.run_once(1_000_000).is_idle());
        assert_eq!(sched.state(id), Ok(TaskState::Terminated));
        assert_eq!(sched.remove(id), Ok(RemoveOutcome::Removed));
        assert!(!sched.contains(id));
    }

    #[test]
    fn test_aperiodic_trigger() {
        let (_, sched) = setup();
        let id = sched.spawn(TaskBuilder::new("irq").kind(TaskKind::Aperiodic)).unwrap();
        assert_eq!(sched.run_once(0).task_id(), Some(id));
        assert_eq!(sched.run_once(5_000), Dispatch::Idle { next_release_us: None });
        sched.trigger(id, 4_000).unwrap();
        assert_eq!(sched.run_once(5_000).task_id(), Some(id));
    }

    #[test]
    fn test_aperiodic_retriggered_from_its_own_work() {
        let timer = SysTimer::software();
        let sched = Arc::new(Scheduler::new(Arc::new(timer)));
        let weak = Arc::downgrade(&sched);
        let id = sched.allocate_id();
        let runs = Arc::new(AtomicU64::new(0));
        let runs_in = runs.clone();
        let task = TaskBuilder::new("irq")
            .kind(TaskKind::Aperiodic)
            .work(move || {
                if runs_in.fetch_add(1, Ordering::Relaxed) == 0 {
                    if let Some(s) = weak.upgrade() {
                        assert_eq!(s.trigger(id, 5), Ok(()));
                    }
                }
            })
            .build(id, 0)
            .unwrap();
        sched.submit(task).unwrap();

        assert_eq!(sched.run_once(0).task_id(), Some(id));
        assert_eq!(sched.run_once(10).task_id(), Some(id));
        assert_eq!(sched.run_once(20), Dispatch::Idle { next_release_us: None });
        assert_eq!(runs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_schedulable_counts_and_sums_same_tasks() {
        let (_, sched) = setup();
        let timing = TaskTiming::from_millis(100, 100).with_wcet(Duration::from_millis(45));
        let a = sched.spawn(TaskBuilder::new("a").timing(timing)).unwrap();
        sched.spawn(TaskBuilder::new("b").timing(timing)).unwrap();
        // 0.9 > 0.828 for two tasks
        assert!(!sched.is_schedulable());
        sched.terminate(a).unwrap();
        assert!((sched.total_utilization() - 0.45).abs() < 1e-9);
        assert!(sched.is_schedulable());
    }

    #[test]
    fn test_sporadic_min_interarrival() {
        let (timer, sched) = setup();
        let id = sched
            .spawn(TaskBuilder::new("btn").kind(TaskKind::sporadic(Duration::from_millis(20))))
            .unwrap();
        assert_eq!(sched.run_once(0).task_id(), Some(id));
        assert_eq!(sched.state(id), Ok(TaskState::Blocked));
        assert_eq!(sched.run_once(10_000), Dispatch::Idle { next_release_us: Some(20_000) });
        timer.advance_to(20_000);
        assert_eq!(sched.run_once(20_000).task_id(), Some(id));
    }

    #[test]
    fn test_set_period_on_aperiodic_through_scheduler() {
        let (_, sched) = setup();
        let id = sched.spawn(TaskBuilder::new("a").kind(TaskKind::Aperiodic)).unwrap();
        assert_eq!(
            sched.set_period(id, Duration::from_millis(5)),
            Err(SchedulerError::InvalidPeriodOnNonPeriodicTask(id))
        );
    }

    #[test]
    fn test_running_task_rejects_mutation_and_defers_removal() {
        let timer = SysTimer::software();
        let sched = Arc::new(Scheduler::new(Arc::new(timer)));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&sched);
        let seen_in = seen.clone();
        let id = sched.allocate_id();
        let task = periodic("self", TaskPriority::NORMAL, 100, 50)
            .work(move || {
                if let Some(s) = weak.upgrade() {
                    seen_in.lock().push(s.set_priority(id, TaskPriority::CRITICAL));
                    seen_in.lock().push(s.suspend(id).map(|_| ()));
                    seen_in.lock().push(s.remove(id).map(|_| ()));
                    assert_eq!(s.run_once(0), Dispatch::Busy(id));
                }
            })
            .build(id, 0)
            .unwrap();
        sched.submit(task).unwrap();

        let Dispatch::Dispatched(report) = sched.run_once(0) else {
            panic!("expected dispatch");
        };
        let seen = seen.lock();
        assert_eq!(seen[0], Err(SchedulerError::InvalidPriorityChangeWhileRunning(id)));
        assert!(matches!(seen[1], Err(SchedulerError::InvalidStateTransition { .. })));
        assert_eq!(seen[2], Ok(()));
        assert!(report.removed);
        assert!(!sched.contains(id));
    }

    #[test]
    fn test_subscribers_receive_events_and_handler_panics_are_recorded() {
        let (_, sched) = setup();
        let got = Arc::new(Mutex::new(Vec::new()));
        let got_in = got.clone();
        sched.subscribe(move |e| got_in.lock().push(e.clone()));
        sched.subscribe(|e| {
            if matches!(e, SchedulerEvent::Submitted { .. }) {
                panic!("handler bug");
            }
        });
        let id = sched.spawn(TaskBuilder::new("x").kind(TaskKind::OneShot)).unwrap();
        sched.run_once(0);

        let got = got.lock();
        assert_eq!(got[0], SchedulerEvent::Submitted { id });
        assert!(got.iter().any(|e| matches!(
            e,
            SchedulerEvent::StateChanged { to: TaskState::Terminated, .. }
        )));
        let records = sched.failure_log().unwrap().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cause, FailureCause::Handler("handler bug".into()));
        assert!(sched.take_events().is_empty());
    }

    #[test]
    fn test_run_until_stop_condition() {
        let (timer, sched) = setup();
        sched.spawn(periodic("p", TaskPriority::NORMAL, 100, 50)).unwrap();
        let n = sched.run(|_, now| now >= 1_000_000);
        assert_eq!(n, 10);
        assert_eq!(timer.now_us(), 1_000_000);
    }

    #[test]
    fn test_schedulability() {
        let (_, sched) = setup();
        for (p, c) in [(100, 10), (100, 50), (1000, 100)] {
            let timing = TaskTiming::from_millis(p, p).with_wcet(Duration::from_millis(c));
            sched.spawn(TaskBuilder::new("t").timing(timing)).unwrap();
        }
        assert!((sched.total_utilization() - 0.7).abs() < 1e-9);
        assert!(sched.is_schedulable());
    }

    #[test]
    fn test_overloaded_not_schedulable() {
        let (_, sched) = setup();
        for (p, c) in [(100, 90), (100, 50)] {
            sched
                .spawn(
                    TaskBuilder::new("t")
                        .timing(TaskTiming::from_millis(p, p).with_wcet(Duration::from_millis(c))),
                )
                .unwrap();
        }
        assert!(!sched.is_schedulable());
    }

    #[test]
    fn test_liu_layland() {
        assert!((liu_layland_bound(1) - 1.0).abs() < 0.001);
        assert!((liu_layland_bound(2) - 0.828).abs() < 0.001);
        assert!((liu_layland_bound(3) - 0.780).abs() < 0.001);
        assert!(liu_layland_bound(1000) > std::f64::consts::LN_2);
    }

    proptest! {
        #[test]
        fn prop_lower_priority_value_always_first(
            prios in proptest::collection::vec(0u8..=255, 1..12),
        ) {
            let (_, sched) = setup();
            for p in &prios {
                let task = TaskBuilder::new("t").kind(TaskKind::OneShot).priority(TaskPriority(*p));
                sched.spawn(task).unwrap();
            }
            let mut order = Vec::new();
            while let Some(id) = sched.run_once(0).task_id() {
                order.push((sched.snapshot(id).unwrap().priority, id));
            }
            let mut sorted = order.clone();
            sorted.sort();
            prop_assert_eq!(order.len(), prios.len());
            prop_assert_eq!(order, sorted);
        }

        #[test]
        fn prop_periodic_release_grid(
            period_ms in 1u64..50,
            deadline_ms in 1u64..50,
            execs in proptest::collection::vec(0u64..120_000, 1..20),
        ) {
            let (timer, sched) = setup();
            let clock = timer.clone();
            let starts = Arc::new(Mutex::new(Vec::new()));
            let starts_in = starts.clone();
            let mut execs_iter = execs.clone().into_iter();
            let id = sched.spawn(
                periodic("grid", TaskPriority::NORMAL, period_ms, deadline_ms).work(move || {
                    starts_in.lock().push(clock.now_us());
                    clock.delay_us(execs_iter.next().unwrap_or(0));
                }),
            ).unwrap();

            let mut releases = Vec::new();
            let mut expected_misses = 0u64;
            for _ in 0..execs.len() {
                let snap = sched.snapshot(id).unwrap();
                prop_assert_eq!(snap.deadline_us, snap.next_release_us + deadline_ms * 1000);
                prop_assert_eq!(snap.next_release_us % (period_ms * 1000), 0);
                timer.advance_to(snap.next_release_us);
                let now = timer.now_us();
                releases.push(snap.next_release_us);
                let Dispatch::Dispatched(report) = sched.run_once(now) else {
                    return Err(TestCaseError::fail("task not dispatched at its release"));
                };
                if report.finished_us > snap.deadline_us {
                    expected_misses += 1;
                }
                prop_assert_eq!(report.missed_deadline, report.finished_us > snap.deadline_us);
            }
            let starts = starts.lock();
            for (start, release) in starts.iter().zip(&releases) {
                prop_assert!(start >= release);
            }
            prop_assert!(releases.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(sched.statistics(id).unwrap().missed_deadlines, expected_misses);
        }
    }
}
