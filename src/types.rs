//! Common types used across Kestrel
//!
//! This module defines shared identifier types to avoid circular dependencies
//! between the scheduler, the lock primitives and the per-CPU containers.

use core::fmt;

/// Task identifier
///
/// The value is the task's slot in the task zone plus one, so zero never
/// names a task. That lets a `TaskId` be packed into a mutex word where zero
/// means "unowned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Build the identifier for zone slot `slot`
    pub const fn from_slot(slot: u32) -> Self {
        TaskId(slot + 1)
    }

    /// Zone slot this identifier refers to
    pub const fn slot(self) -> u32 {
        self.0 - 1
    }

    /// Raw value as stored in packed words
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Processor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Slot index for per-CPU containers
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Blocking ticket
///
/// A task takes a fresh ticket before it goes to sleep. A wakeup only counts
/// if it names the ticket the task is currently blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticket(pub u64);

impl Ticket {
    /// Ticket consumed by the wakeup that first starts a task
    pub const INITIAL: Ticket = Ticket(0);
}

/// Scheduling priority (higher is more urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u8);

impl Priority {
    pub const fn level(self) -> usize {
        self.0 as usize
    }
}

/// Maximum task name length
pub const TASK_NAME_LEN: usize = 16;

/// Fixed-capacity task name
pub type TaskName = heapless::String<TASK_NAME_LEN>;

/// Build a task name, truncating at a character boundary if needed
pub fn task_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_slots() {
        let id = TaskId::from_slot(0);
        assert_eq!(id.0, 1);
        assert_eq!(id.slot(), 0);
        assert_eq!(TaskId::from_slot(41).slot(), 41);
    }

    #[test]
    fn test_task_name_truncates() {
        let name = task_name("a-very-long-kernel-thread-name");
        assert_eq!(name.len(), TASK_NAME_LEN);
        assert_eq!(name.as_str(), "a-very-long-kern");
        assert_eq!(task_name("idle/0").as_str(), "idle/0");
    }
}
