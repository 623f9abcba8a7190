//! Scheduler events
//!
//! Observable notifications (deadline misses, failures, lifecycle changes)
//! go through one queue. The dispatch loop drains it to subscribed handlers
//! after each dispatch decision; with no subscribers the events stay queued
//! until `take_events`.
//!
//! Author: Moroya Sakamoto

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::SchedulerError;
use crate::task::{TaskId, TaskState};

/// Something observable happened inside the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Submitted { id: TaskId },
    Removed { id: TaskId },
    /// Dispatch finished after its absolute deadline
    DeadlineMissed {
        id: TaskId,
        deadline_us: u64,
        finished_us: u64,
    },
    /// Work closure failed; `terminated` reflects the failure policy
    TaskFailed {
        id: TaskId,
        reason: String,
        terminated: bool,
    },
    StateChanged {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            SchedulerEvent::Submitted { id }
            | SchedulerEvent::Removed { id }
            | SchedulerEvent::DeadlineMissed { id, .. }
            | SchedulerEvent::TaskFailed { id, .. }
            | SchedulerEvent::StateChanged { id, .. } => *id,
        }
    }

    /// Deadline misses and failures; these are never evicted
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::DeadlineMissed { .. } | SchedulerEvent::TaskFailed { .. }
        )
    }

    /// Soft error carried by this event, if any
    pub fn to_error(&self) -> Option<SchedulerError> {
        match self {
            SchedulerEvent::DeadlineMissed {
                id,
                deadline_us,
                finished_us,
            } => Some(SchedulerError::DeadlineMissed {
                id: *id,
                deadline_us: *deadline_us,
                finished_us: *finished_us,
            }),
            SchedulerEvent::TaskFailed { id, reason, .. } => Some(SchedulerError::TaskWorkFailure {
                id: *id,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// Multi-producer event queue
///
/// Deadline misses and task failures go to an unbounded lane and are never
/// dropped. Lifecycle events share a bounded lane; when it is full the oldest
/// lifecycle event is evicted. `drain` merges both lanes in push order.
pub struct EventQueue {
    lifecycle_tx: Sender<(u64, SchedulerEvent)>,
    lifecycle_rx: Receiver<(u64, SchedulerEvent)>,
    alert_tx: Sender<(u64, SchedulerEvent)>,
    alert_rx: Receiver<(u64, SchedulerEvent)>,
    seq: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (lifecycle_tx, lifecycle_rx) = crossbeam_channel::bounded(capacity.max(1));
        let (alert_tx, alert_rx) = crossbeam_channel::unbounded();
        Self {
            lifecycle_tx,
            lifecycle_rx,
            alert_tx,
            alert_rx,
            seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking
    pub fn push(&self, event: SchedulerEvent) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if event.is_alert() {
            let _ = self.alert_tx.send((seq, event));
            return;
        }
        let mut entry = (seq, event);
        loop {
            match self.lifecycle_tx.try_send(entry) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if let Ok((_, old)) = self.lifecycle_rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        log::trace!("event queue full, evicted {old:?}");
                    }
                    entry = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Take everything queued right now, oldest first
    pub fn drain(&self) -> Vec<SchedulerEvent> {
        let mut entries: Vec<_> = self.alert_rx.try_iter().collect();
        entries.extend(self.lifecycle_rx.try_iter());
        entries.sort_unstable_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, event)| event).collect()
    }

    pub fn len(&self) -> usize {
        self.lifecycle_rx.len() + self.alert_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lifecycle_rx.is_empty() && self.alert_rx.is_empty()
    }

    /// Lifecycle events evicted by overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
