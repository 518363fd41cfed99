//! Tasks
//!
//! A task is the unit of scheduling. Its scheduling fields are atomics so
//! that wakers on other CPUs can inspect them without taking the task's
//! runqueue lock; the wake protocol in `sched_prim` relies on the exact
//! ordering of those accesses.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

use crate::types::{CpuId, Priority, TaskId, TaskName, Ticket};

/// `on_cpu` value of a task that no CPU is executing
pub const NOT_RUNNING: u32 = u32::MAX;

// ============================================================================
// Task State
// ============================================================================

/// Scheduling state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued or executing
    Runnable = 0,
    /// Sleeping; signals end the sleep
    Interruptible = 1,
    /// Sleeping; only an explicit wake ends the sleep
    Uninterruptible = 2,
    /// Exited, waiting for the reaper
    Zombie = 3,
    /// Released; the handle is dead
    Reaped = 4,
}

impl TaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Runnable,
            1 => Self::Interruptible,
            2 => Self::Uninterruptible,
            3 => Self::Zombie,
            4 => Self::Reaped,
            _ => unreachable!("corrupt task state {}", raw),
        }
    }

    /// Whether the task is waiting for a wake
    pub fn is_sleeping(self) -> bool {
        matches!(self, Self::Interruptible | Self::Uninterruptible)
    }
}

/// Kind of sleep a task may enter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepState {
    Interruptible,
    Uninterruptible,
}

impl From<SleepState> for TaskState {
    fn from(state: SleepState) -> Self {
        match state {
            SleepState::Interruptible => TaskState::Interruptible,
            SleepState::Uninterruptible => TaskState::Uninterruptible,
        }
    }
}

bitflags! {
    /// Static task attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Per-CPU idle task; never queued
        const IDLE = 1 << 0;
        /// Always runs on the CPU it last ran on
        const NOMIGRATE = 1 << 1;
    }
}

// ============================================================================
// Task
// ============================================================================

/// Schedulable entity
pub struct Task {
    id: TaskId,
    name: TaskName,
    priority: Priority,
    flags: TaskFlags,
    state: AtomicU8,
    /// Monotonic wake ticket; a wake must name the current value
    unblock_ticket: AtomicU64,
    /// A wake arrived that has not been turned into an enqueue yet
    pub(crate) pending_wakeup: AtomicBool,
    /// CPU executing the task, or `NOT_RUNNING`
    pub(crate) on_cpu: AtomicU32,
    pub(crate) last_cpu: AtomicU32,
}

impl Task {
    /// A task that has never run; it sleeps until started with `Ticket::INITIAL`
    pub fn new(id: TaskId, name: TaskName, priority: Priority, flags: TaskFlags, cpu: CpuId) -> Self {
        Self {
            id,
            name,
            priority,
            flags,
            state: AtomicU8::new(TaskState::Uninterruptible as u8),
            unblock_ticket: AtomicU64::new(Ticket::INITIAL.0),
            pending_wakeup: AtomicBool::new(false),
            on_cpu: AtomicU32::new(NOT_RUNNING),
            last_cpu: AtomicU32::new(cpu.0),
        }
    }

    /// The idle task of `cpu`, already running there
    pub fn new_idle(id: TaskId, name: TaskName, cpu: CpuId) -> Self {
        let task = Self::new(id, name, Priority(0), TaskFlags::IDLE | TaskFlags::NOMIGRATE, cpu);
        task.set_state(TaskState::Runnable);
        task.on_cpu.store(cpu.0, Ordering::Relaxed);
        task
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &TaskName {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(TaskFlags::IDLE)
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Current wake ticket
    pub fn ticket(&self) -> Ticket {
        Ticket(self.unblock_ticket.load(Ordering::SeqCst))
    }

    /// Invalidate outstanding wakes and return the new ticket
    pub(crate) fn next_ticket(&self) -> Ticket {
        Ticket(self.unblock_ticket.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Consume `ticket`; only one waker can win it
    pub(crate) fn claim_ticket(&self, ticket: Ticket) -> bool {
        self.unblock_ticket
            .compare_exchange(ticket.0, ticket.0 + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// CPU currently executing the task
    pub fn on_cpu(&self) -> Option<CpuId> {
        match self.on_cpu.load(Ordering::SeqCst) {
            NOT_RUNNING => None,
            cpu => Some(CpuId(cpu)),
        }
    }

    pub fn last_cpu(&self) -> CpuId {
        CpuId(self.last_cpu.load(Ordering::Relaxed))
    }

    /// Priority as compared against a runqueue's current priority (idle is -1)
    pub(crate) fn effective_priority(&self) -> i32 {
        if self.is_idle() {
            -1
        } else {
            i32::from(self.priority.0)
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("priority", &self.priority.0)
            .field("state", &self.state())
            .field("on_cpu", &self.on_cpu())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::task_name;

    #[test]
    fn test_new_task_sleeps_until_started() {
        let t = Task::new(TaskId(3), task_name("worker"), Priority(7), TaskFlags::empty(), CpuId(1));
        assert_eq!(t.state(), TaskState::Uninterruptible);
        assert_eq!(t.ticket(), Ticket::INITIAL);
        assert_eq!(t.on_cpu(), None);
        assert_eq!(t.last_cpu(), CpuId(1));
        assert_eq!(t.effective_priority(), 7);
    }

    #[test]
    fn test_ticket_claimed_once() {
        let t = Task::new(TaskId(1), task_name("t"), Priority(1), TaskFlags::empty(), CpuId(0));
        let ticket = t.next_ticket();
        assert!(t.claim_ticket(ticket));
        assert!(!t.claim_ticket(ticket));
        let stale = ticket;
        let fresh = t.next_ticket();
        assert!(!t.claim_ticket(stale));
        assert!(t.claim_ticket(fresh));
    }

    #[test]
    fn test_idle_task_shape() {
        let idle = Task::new_idle(TaskId(1), task_name("idle/0"), CpuId(0));
        assert!(idle.is_idle());
        assert!(idle.flags().contains(TaskFlags::NOMIGRATE));
        assert_eq!(idle.state(), TaskState::Runnable);
        assert_eq!(idle.on_cpu(), Some(CpuId(0)));
        assert_eq!(idle.effective_priority(), -1);
    }
}
