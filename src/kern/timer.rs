//! Kernel Timers
//!
//! One timer queue per CPU, ordered by deadline. The earliest deadline is
//! what the CPU's one-shot hardware timer is programmed with; the timer
//! interrupt only raises `PendingWork::TIMER`, and expired entries are run
//! from the DPC dispatch loop with the queue lock released.
//!
//! Lock order: run queue, then timer queue.

use alloc::collections::BTreeMap;

use log::trace;

use crate::kern::dpc::PendingWork;
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::types::{CpuId, TaskId, Ticket};

// ============================================================================
// Timer Queue
// ============================================================================

/// Action taken when a timer expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCallback {
    /// End of the running task's timeslice
    Timeslice,
    /// Timed sleep ran out
    Wake { task: TaskId, ticket: Ticket },
}

/// Handle to an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub cpu: CpuId,
    deadline: u64,
    seq: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

/// Deadline-ordered timers of one CPU
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(u64, u64), TimerCallback>,
    next_seq: u64,
}

impl TimerQueue {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Insert a timer; the flag says whether it is now the earliest one
    pub fn arm(&mut self, cpu: CpuId, deadline: u64, callback: TimerCallback) -> (TimerHandle, bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), callback);
        let earliest = self.next_deadline() == Some(deadline);
        (TimerHandle { cpu, deadline, seq }, earliest)
    }

    /// Remove a timer that has not fired; false if it already expired
    pub fn cancel(&mut self, handle: &TimerHandle) -> bool {
        self.entries.remove(&(handle.deadline, handle.seq)).is_some()
    }

    /// Remove and return the earliest timer due at `now`
    pub fn pop_expired(&mut self, now: u64) -> Option<TimerCallback> {
        let (&key, _) = self.entries.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Kernel timer services
// ============================================================================

impl<P: Platform> Kernel<P> {
    /// Arm a timer on `cpu`, reprogramming the hardware if it became earliest
    pub(crate) fn arm_timer(&self, cpu: CpuId, deadline: u64, callback: TimerCallback) -> TimerHandle {
        let mut queue = self.timers[cpu].lock(&self.platform);
        let (handle, earliest) = queue.arm(cpu, deadline, callback);
        if earliest {
            self.platform.arm_timer(cpu, deadline);
        }
        handle
    }

    pub(crate) fn cancel_timer(&self, handle: &TimerHandle) -> bool {
        self.timers[handle.cpu].lock(&self.platform).cancel(handle)
    }

    /// Start the round-robin timer of `cpu` unless one is pending
    pub(crate) fn arm_timeslice(&self, cpu: CpuId, timeslice: &mut Option<TimerHandle>) {
        if timeslice.is_none() {
            let deadline = self.platform.now_ns().saturating_add(self.config.timeslice_ns);
            *timeslice = Some(self.arm_timer(cpu, deadline, TimerCallback::Timeslice));
        }
    }

    /// Timer DPC: run everything that has expired on this CPU
    pub(crate) fn run_timers(&self) {
        let cpu = self.cpu_id();
        loop {
            let now = self.platform.now_ns();
            let Some(callback) = self.timers[cpu].lock(&self.platform).pop_expired(now) else {
                break;
            };
            trace!("{}: timer {:?} fired at {}", cpu, callback, now);
            match callback {
                TimerCallback::Timeslice => {
                    self.runqueues[cpu].lock(&self.platform).timeslice = None;
                    self.raise(cpu, PendingWork::RESCHEDULE);
                }
                TimerCallback::Wake { task, ticket } => {
                    self.sched_wake(task, ticket);
                }
            }
        }
        let next = self.timers[cpu].lock(&self.platform).next_deadline();
        if let Some(deadline) = next {
            self.platform.arm_timer(cpu, deadline);
        }
    }

    /// Timer interrupt entry point
    pub fn timer_interrupt(&self) {
        let cpu = self.cpu_id();
        let now = self.platform.now_ns();
        let due = self.timers[cpu]
            .lock(&self.platform)
            .next_deadline()
            .is_some_and(|deadline| deadline <= now);
        if due {
            self.raise(cpu, PendingWork::TIMER);
        }
        self.irq_exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_earliest_flag_and_order() {
        let mut q = TimerQueue::new();
        let (_, first) = q.arm(CpuId(0), 300, TimerCallback::Timeslice);
        let (_, later) = q.arm(CpuId(0), 500, TimerCallback::Timeslice);
        let wake = TimerCallback::Wake {
            task: TaskId(2),
            ticket: Ticket(4),
        };
        let (_, earlier) = q.arm(CpuId(0), 100, wake);
        assert!(first);
        assert!(!later);
        assert!(earlier);
        assert_eq!(q.next_deadline(), Some(100));

        assert_eq!(q.pop_expired(99), None);
        assert_eq!(q.pop_expired(300), Some(wake));
        assert_eq!(q.pop_expired(300), Some(TimerCallback::Timeslice));
        assert_eq!(q.pop_expired(300), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut q = TimerQueue::new();
        let (a, _) = q.arm(CpuId(1), 10, TimerCallback::Timeslice);
        let (b, _) = q.arm(CpuId(1), 10, TimerCallback::Timeslice);
        assert!(q.cancel(&a));
        assert!(!q.cancel(&a));
        assert_eq!(q.next_deadline(), Some(10));
        assert!(q.cancel(&b));
        assert!(q.is_empty());
        assert_eq!(b.deadline(), 10);
        assert_eq!(b.cpu, CpuId(1));
    }
}
