//! System timer — monotonic time sources for the dispatch loop
//!
//! All absolute times are microseconds on the scheduler's clock.
//! `SysTimer` is a shared software counter advanced explicitly, which gives
//! deterministic simulated runs; `MonotonicClock` follows wall time.
//!
//! Author: Moroya Sakamoto

use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Time source used by the scheduler.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_us(&self) -> u64;

    /// Idle until `deadline_us`, returning early if `wake` is signalled.
    fn sleep_until(&self, deadline_us: u64, wake: &WakeSignal);
}

/// Wake flag for an idle dispatch loop.
///
/// Kept apart from the registry lock so mutators can wake the loop without
/// holding the registry.
#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake any waiter
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_all();
    }

    /// Consume a pending wake, if any
    pub fn take(&self) -> bool {
        core::mem::replace(&mut *self.pending.lock(), false)
    }

    /// Is a wake pending? Does not consume it.
    pub fn is_pending(&self) -> bool {
        *self.pending.lock()
    }

    /// Block for at most `timeout`. Returns true if woken by `notify`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let until = Instant::now() + timeout;
            while !*pending {
                if self.cond.wait_until(&mut pending, until).timed_out() {
                    break;
                }
            }
        }
        core::mem::replace(&mut *pending, false)
    }
}

/// Software system timer
///
/// Cloning yields a handle to the same counter, so work closures can hold a
/// handle and "consume" simulated execution time with `delay_us`.
#[derive(Debug, Clone, Default)]
pub struct SysTimer {
    ticks_us: Arc<AtomicU64>,
}

impl SysTimer {
    /// Software timer starting at t = 0
    pub fn software() -> Self {
        Self::default()
    }

    /// Software timer starting at `start_us`
    pub fn starting_at(start_us: u64) -> Self {
        Self {
            ticks_us: Arc::new(AtomicU64::new(start_us)),
        }
    }

    /// Advance time by microseconds
    pub fn advance(&self, us: u64) {
        let _ = self
            .ticks_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.saturating_add(us)));
    }

    /// Move time forward to `t_us`; never moves backwards.
    pub fn advance_to(&self, t_us: u64) {
        self.ticks_us.fetch_max(t_us, Ordering::AcqRel);
    }

    /// Current time in microseconds
    pub fn now_us(&self) -> u64 {
        self.ticks_us.load(Ordering::Acquire)
    }

    /// Simulate `us` of busy execution
    pub fn delay_us(&self, us: u64) {
        self.advance(us);
    }

    /// Simulate busy execution for a `Duration`
    pub fn delay(&self, d: Duration) {
        self.advance(duration_us(d));
    }
}

impl Clock for SysTimer {
    fn now_us(&self) -> u64 {
        SysTimer::now_us(self)
    }

    // Simulated time jumps straight to the target unless a wake is pending.
    fn sleep_until(&self, deadline_us: u64, wake: &WakeSignal) {
        if wake.take() {
            return;
        }
        self.advance_to(deadline_us);
    }
}

/// Wall-clock time source, microseconds since construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        duration_us(self.origin.elapsed())
    }

    fn sleep_until(&self, deadline_us: u64, wake: &WakeSignal) {
        let now = self.now_us();
        if deadline_us <= now {
            wake.take();
            return;
        }
        wake.wait_timeout(Duration::from_micros(deadline_us - now));
    }
}

/// Duration in whole microseconds, saturating at `u64::MAX`
pub fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Absolute deadline of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    deadline: u64,
}

impl Deadline {
    /// Deadline `relative_us` after the job's release
    pub fn new(release_us: u64, relative_us: u64) -> Self {
        Self {
            deadline: release_us.saturating_add(relative_us),
        }
    }

    /// Absolute deadline
    pub fn at(&self) -> u64 {
        self.deadline
    }

    /// Check if deadline is met
    pub fn is_met(&self, current: u64) -> bool {
        current <= self.deadline
    }

    /// How far past the deadline `current` is (0 if met)
    pub fn lateness(&self, current: u64) -> u64 {
        current.saturating_sub(self.deadline)
    }
}
