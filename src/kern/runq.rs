//! Run Queue Management
//!
//! Each CPU owns one run queue: a FIFO per priority level plus a bitmap of
//! non-empty levels, so the highest runnable priority is found with a single
//! leading-zero count. Higher numeric priority is more urgent.
//!
//! The queue itself is not synchronized; it lives inside an `IrqLock` in the
//! kernel's per-CPU array.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::kern::task::Task;
use crate::kern::timer::TimerHandle;
use crate::types::Priority;

/// Per-CPU run queue
#[derive(Debug)]
pub struct RunQueue {
    /// One FIFO per priority level
    queues: Vec<VecDeque<Arc<Task>>>,
    /// Bit `p` set iff `queues[p]` is non-empty
    bitmap: u64,
    /// Number of queued tasks
    queued: usize,
    /// Task executing on this CPU
    pub(crate) current: Arc<Task>,
    /// This CPU's idle task
    pub(crate) idle: Arc<Task>,
    /// Priority of `current`; -1 while idling
    pub(crate) current_priority: i32,
    /// Runnable tasks assigned to this CPU, the executing one included
    pub(crate) load: usize,
    /// Armed round-robin timer, if any
    pub(crate) timeslice: Option<TimerHandle>,
}

impl RunQueue {
    /// Create a run queue whose CPU is executing `idle`
    pub fn new(levels: usize, idle: Arc<Task>) -> Self {
        assert!(levels <= 64, "{} priority levels exceed the bitmap", levels);
        Self {
            queues: (0..levels).map(|_| VecDeque::new()).collect(),
            bitmap: 0,
            queued: 0,
            current: Arc::clone(&idle),
            idle,
            current_priority: -1,
            load: 0,
            timeslice: None,
        }
    }

    /// Number of queued (not executing) tasks
    pub fn len(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }

    /// Whether no task is queued at `priority`
    pub fn level_is_empty(&self, priority: Priority) -> bool {
        self.bitmap & (1u64 << priority.level()) == 0
    }

    /// Append `task` to the tail of its priority level
    pub fn push(&mut self, task: Arc<Task>) {
        let level = task.priority().level();
        assert!(level < self.queues.len(), "priority {} out of range", level);
        debug_assert!(!task.is_idle(), "idle task queued");
        self.queues[level].push_back(task);
        self.bitmap |= 1u64 << level;
        self.queued += 1;
    }

    /// Remove the head of the highest non-empty level
    pub fn pop_highest(&mut self) -> Option<Arc<Task>> {
        let level = self.highest_level()?;
        let task = self.queues[level].pop_front();
        if self.queues[level].is_empty() {
            self.bitmap &= !(1u64 << level);
        }
        self.queued -= 1;
        task
    }

    /// Head of the highest non-empty level, left in place
    pub fn peek_highest(&self) -> Option<&Arc<Task>> {
        self.queues[self.highest_level()?].front()
    }

    fn highest_level(&self) -> Option<usize> {
        if self.bitmap == 0 {
            None
        } else {
            Some(63 - self.bitmap.leading_zeros() as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::task::TaskFlags;
    use crate::types::{task_name, CpuId, TaskId};

    fn task(id: u32, prio: u8) -> Arc<Task> {
        Arc::new(Task::new(TaskId(id), task_name("t"), Priority(prio), TaskFlags::empty(), CpuId(0)))
    }

    fn idle() -> Arc<Task> {
        Arc::new(Task::new_idle(TaskId(100), task_name("idle/0"), CpuId(0)))
    }

    #[test]
    fn test_highest_priority_first() {
        let mut rq = RunQueue::new(32, idle());
        rq.push(task(1, 5));
        rq.push(task(2, 10));
        rq.push(task(3, 0));
        assert_eq!(rq.peek_highest().map(|t| t.id()), Some(TaskId(2)));
        let order: Vec<u32> = core::iter::from_fn(|| rq.pop_highest()).map(|t| t.id().0).collect();
        assert_eq!(order, [2, 1, 3]);
        assert!(rq.is_empty());
    }

    #[test]
    fn test_fifo_within_level() {
        let mut rq = RunQueue::new(8, idle());
        for id in 1..=3 {
            rq.push(task(id, 4));
        }
        assert!(!rq.level_is_empty(Priority(4)));
        assert_eq!(rq.pop_highest().unwrap().id(), TaskId(1));
        assert_eq!(rq.pop_highest().unwrap().id(), TaskId(2));
        assert_eq!(rq.pop_highest().unwrap().id(), TaskId(3));
        assert!(rq.level_is_empty(Priority(4)));
    }

    #[test]
    fn test_top_level_bit() {
        let mut rq = RunQueue::new(64, idle());
        rq.push(task(1, 63));
        rq.push(task(2, 0));
        assert_eq!(rq.pop_highest().unwrap().id(), TaskId(1));
        assert_eq!(rq.pop_highest().unwrap().id(), TaskId(2));
    }
}
