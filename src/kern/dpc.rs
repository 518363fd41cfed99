//! DPC - Deferred Procedure Calls
//!
//! Work that interrupts (or code running with DPCs disabled) cannot do on
//! the spot is recorded as a pending bit on the CPU and dispatched when the
//! CPU's DPC nesting depth drops back to zero: at `enable_dpc` and on the
//! way out of an interrupt.
//!
//! Dispatch runs at depth 1, in a fixed order: expired timers, RCU
//! callbacks, the reaper, then a reschedule. It loops until nothing is
//! pending, since each step may raise more work.
//!
//! Every context switch happens at depth 1 and resumes at depth 1, which
//! keeps the per-CPU depth consistent across switches.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::kern::task::Task;
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::types::CpuId;

bitflags! {
    /// Deferred work pending on a CPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingWork: u32 {
        /// The timer queue has expired entries
        const TIMER = 1 << 0;
        /// This CPU holds RCU callbacks whose grace period ended
        const RCU = 1 << 1;
        /// Zombies are waiting in this CPU's reap queue
        const REAP = 1 << 2;
        /// The running task should give up the CPU
        const RESCHEDULE = 1 << 3;
    }
}

// ============================================================================
// Per-CPU state
// ============================================================================

/// Per-CPU scheduling and DPC state
#[derive(Debug)]
pub struct CpuLocal {
    /// DPC nesting depth; DPCs run only when it returns to zero
    pub(crate) dpc_depth: AtomicU32,
    /// `PendingWork` bits
    pub(crate) pending: AtomicU32,
    /// Raw id of the executing task, zero before the CPU starts
    pub(crate) current: AtomicU32,
    /// Exited tasks waiting to be released
    pub(crate) reap_queue: spin::Mutex<VecDeque<Arc<Task>>>,
}

impl CpuLocal {
    pub fn new() -> Self {
        Self {
            dpc_depth: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            current: AtomicU32::new(0),
            reap_queue: spin::Mutex::new(VecDeque::new()),
        }
    }

    pub fn pending(&self) -> PendingWork {
        PendingWork::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    pub fn dpc_depth(&self) -> u32 {
        self.dpc_depth.load(Ordering::Relaxed)
    }
}

impl Default for CpuLocal {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// DPC control
// ============================================================================

impl<P: Platform> Kernel<P> {
    pub(crate) fn local(&self) -> &CpuLocal {
        &self.cpus[self.cpu_id()]
    }

    /// Defer DPC dispatch on this CPU; nests
    pub fn disable_dpc(&self) {
        self.local().dpc_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo one `disable_dpc`, dispatching pending work at depth zero
    pub fn enable_dpc(&self) {
        let local = self.local();
        let depth = local.dpc_depth.load(Ordering::Relaxed);
        if depth == 0 {
            panic!("{}: enable_dpc without matching disable_dpc", self.cpu_id());
        }
        local.dpc_depth.store(depth - 1, Ordering::Relaxed);
        if depth == 1 && !local.pending().is_empty() {
            self.dispatch_dpcs();
        }
    }

    /// Whether DPCs are currently deferred on this CPU
    pub fn dpc_disabled(&self) -> bool {
        self.local().dpc_depth() != 0
    }

    /// Record deferred work on `cpu`
    pub fn raise(&self, cpu: CpuId, work: PendingWork) {
        self.cpus[cpu].pending.fetch_or(work.bits(), Ordering::AcqRel);
    }

    /// Interrupt epilogue: run DPCs unless the interrupted code deferred them
    pub fn irq_exit(&self) {
        let local = self.local();
        if local.dpc_depth() == 0 && !local.pending().is_empty() {
            self.dispatch_dpcs();
        }
    }

    /// Reschedule IPI entry point
    pub fn reschedule_ipi(&self) {
        self.raise(self.cpu_id(), PendingWork::RESCHEDULE);
        self.irq_exit();
    }

    fn dispatch_dpcs(&self) {
        let cpu = self.cpu_id();
        let local = &self.cpus[cpu];
        loop {
            local.dpc_depth.fetch_add(1, Ordering::Relaxed);
            loop {
                let taken = local
                    .pending
                    .fetch_and(PendingWork::RESCHEDULE.bits(), Ordering::AcqRel);
                let work = PendingWork::from_bits_truncate(taken);
                if work.contains(PendingWork::TIMER) {
                    self.run_timers();
                }
                if work.contains(PendingWork::RCU) {
                    self.rcu.run_callbacks(cpu, self);
                }
                if work.contains(PendingWork::REAP) {
                    self.reap_zombies();
                }
                if local.pending().contains(PendingWork::RESCHEDULE) {
                    self.schedule_locked();
                }
                if local.pending().is_empty() {
                    break;
                }
            }
            local.dpc_depth.fetch_sub(1, Ordering::Relaxed);
            // An interrupt between the last check and the decrement saw a
            // non-zero depth and left its work for us.
            if local.pending().is_empty() {
                return;
            }
        }
    }
}
