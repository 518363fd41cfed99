//! Platform services
//!
//! Everything the concurrency core needs from the machine: the CPU number,
//! a monotonic clock, one-shot timers, reschedule IPIs, interrupt masking
//! and the low-level context switch. An architecture port implements
//! `Platform`; `sim::SimPlatform` is a deterministic stand-in used by tests
//! and host tools.

use alloc::sync::Arc;

use crate::error::KernError;
use crate::kern::lock::IrqControl;
use crate::kern::task::Task;
use crate::types::{CpuId, TaskId};

#[cfg(any(test, feature = "sim"))]
pub mod sim;

/// Machine-level services consumed by the kernel
pub trait Platform: IrqControl + Send + Sync {
    /// CPU the caller is running on
    fn cpu_id(&self) -> CpuId;

    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Interrupt `cpu` so it notices new work on its runqueue
    fn send_reschedule_ipi(&self, cpu: CpuId);

    /// Program the local one-shot timer of `cpu` to fire at `deadline_ns`
    fn arm_timer(&self, cpu: CpuId, deadline_ns: u64);

    /// Set up the execution context (stack, initial frame) of a new task
    fn prepare_task(&self, task: &Task) -> Result<(), KernError>;

    /// Switch from `prev` to `next` on `cpu`
    ///
    /// Returns once some later switch resumes `prev`, yielding the task that
    /// ran immediately before it so the caller can finish that switch.
    /// The per-task DPC nesting level is the same on both sides of every
    /// switch, so the port does not need to save it.
    fn context_switch(&self, cpu: CpuId, prev: &Arc<Task>, next: &Arc<Task>) -> Arc<Task>;

    /// Free whatever `prepare_task` allocated
    fn release_task(&self, task: &Task);

    /// Enable interrupts and halt until one arrives
    fn wait_for_interrupt(&self);

    /// Whether `task` has a signal that interrupts interruptible sleeps
    fn has_pending_signal(&self, task: TaskId) -> bool;
}
