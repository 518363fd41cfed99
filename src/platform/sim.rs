//! Simulated platform
//!
//! A deterministic single-threaded machine. The test (or host tool) picks
//! which CPU is "executing" with `set_cpu`, drives the clock by hand and
//! delivers interrupts by calling the kernel's interrupt entry points.
//!
//! `context_switch` returns immediately with `prev`: the code after the
//! switch keeps running, but on behalf of the new current task.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use super::Platform;
use crate::error::KernError;
use crate::kern::lock::IrqControl;
use crate::kern::task::Task;
use crate::types::{CpuId, TaskId};

/// Recorded context switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRecord {
    pub cpu: CpuId,
    pub prev: TaskId,
    pub next: TaskId,
}

const NO_TIMER: u64 = u64::MAX;

/// Deterministic machine model
#[derive(Debug)]
pub struct SimPlatform {
    cpu: AtomicU32,
    clock: AtomicU64,
    irq_enabled: Box<[AtomicBool]>,
    timers: Box<[AtomicU64]>,
    ipis: spin::Mutex<Vec<CpuId>>,
    switches: spin::Mutex<Vec<SwitchRecord>>,
    signals: spin::Mutex<Vec<TaskId>>,
    released: spin::Mutex<Vec<TaskId>>,
    fail_prepare: AtomicBool,
    halts: AtomicUsize,
}

impl SimPlatform {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpu: AtomicU32::new(0),
            clock: AtomicU64::new(0),
            irq_enabled: (0..nr_cpus).map(|_| AtomicBool::new(true)).collect(),
            timers: (0..nr_cpus).map(|_| AtomicU64::new(NO_TIMER)).collect(),
            ipis: spin::Mutex::new(Vec::new()),
            switches: spin::Mutex::new(Vec::new()),
            signals: spin::Mutex::new(Vec::new()),
            released: spin::Mutex::new(Vec::new()),
            fail_prepare: AtomicBool::new(false),
            halts: AtomicUsize::new(0),
        }
    }

    /// Make `cpu` the executing processor
    pub fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu.0, Ordering::Relaxed);
    }

    /// Move the clock forward
    pub fn advance(&self, ns: u64) {
        self.clock.fetch_add(ns, Ordering::Relaxed);
    }

    /// Drain the IPIs sent so far
    pub fn take_ipis(&self) -> Vec<CpuId> {
        core::mem::take(&mut *self.ipis.lock())
    }

    /// Deadline last programmed on `cpu`
    pub fn programmed_timer(&self, cpu: CpuId) -> Option<u64> {
        let deadline = self.timers[cpu.index()].load(Ordering::Relaxed);
        (deadline != NO_TIMER).then_some(deadline)
    }

    pub fn switches(&self) -> Vec<SwitchRecord> {
        self.switches.lock().clone()
    }

    pub fn raise_signal(&self, task: TaskId) {
        self.signals.lock().push(task);
    }

    pub fn clear_signal(&self, task: TaskId) {
        self.signals.lock().retain(|&t| t != task);
    }

    /// Tasks whose context has been released
    pub fn released(&self) -> Vec<TaskId> {
        self.released.lock().clone()
    }

    /// Make the next `prepare_task` fail
    pub fn fail_next_prepare(&self) {
        self.fail_prepare.store(true, Ordering::Relaxed);
    }

    /// Number of `wait_for_interrupt` calls
    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::Relaxed)
    }

    pub fn irq_enabled(&self, cpu: CpuId) -> bool {
        self.irq_enabled[cpu.index()].load(Ordering::Relaxed)
    }
}

impl IrqControl for SimPlatform {
    fn irq_save(&self) -> bool {
        self.irq_enabled[self.cpu.load(Ordering::Relaxed) as usize].swap(false, Ordering::Relaxed)
    }

    fn irq_restore(&self, was_enabled: bool) {
        self.irq_enabled[self.cpu.load(Ordering::Relaxed) as usize]
            .store(was_enabled, Ordering::Relaxed);
    }
}

impl Platform for SimPlatform {
    fn cpu_id(&self) -> CpuId {
        CpuId(self.cpu.load(Ordering::Relaxed))
    }

    fn now_ns(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn send_reschedule_ipi(&self, cpu: CpuId) {
        self.ipis.lock().push(cpu);
    }

    fn arm_timer(&self, cpu: CpuId, deadline_ns: u64) {
        self.timers[cpu.index()].store(deadline_ns, Ordering::Relaxed);
    }

    fn prepare_task(&self, _task: &Task) -> Result<(), KernError> {
        if self.fail_prepare.swap(false, Ordering::Relaxed) {
            return Err(KernError::Platform("no memory for task stack"));
        }
        Ok(())
    }

    fn context_switch(&self, cpu: CpuId, prev: &Arc<Task>, next: &Arc<Task>) -> Arc<Task> {
        self.switches.lock().push(SwitchRecord {
            cpu,
            prev: prev.id(),
            next: next.id(),
        });
        Arc::clone(prev)
    }

    fn release_task(&self, task: &Task) {
        self.released.lock().push(task.id());
    }

    fn wait_for_interrupt(&self) {
        self.halts.fetch_add(1, Ordering::Relaxed);
    }

    fn has_pending_signal(&self, task: TaskId) -> bool {
        self.signals.lock().contains(&task)
    }
}
