//! The kernel context
//!
//! All scheduler, timer and RCU state hangs off one `Kernel` value that the
//! architecture layer creates at boot and shares between CPUs. Subsystems
//! add their operations in `impl Kernel` blocks inside their own modules.

use alloc::sync::Arc;
use core::sync::atomic::AtomicU64;

use crate::config::KernelConfig;
use crate::kern::dpc::CpuLocal;
use crate::kern::lock::IrqLock;
use crate::kern::percpu::PerCpu;
use crate::kern::rcu::Rcu;
use crate::kern::runq::RunQueue;
use crate::kern::sched_prim::Blocker;
use crate::kern::task::{SleepState, Task};
use crate::kern::timer::TimerQueue;
use crate::kern::zalloc::Zone;
use crate::platform::Platform;
use crate::types::{task_name, CpuId, TaskId, TaskName, Ticket};

/// Scheduler, timers and RCU for one machine
pub struct Kernel<P: Platform> {
    pub(crate) config: KernelConfig,
    pub(crate) platform: P,
    /// Every live task, indexed by `TaskId::slot`
    pub(crate) tasks: IrqLock<Zone<Arc<Task>>>,
    pub(crate) cpus: PerCpu<CpuLocal>,
    pub(crate) runqueues: PerCpu<IrqLock<RunQueue>>,
    pub(crate) timers: PerCpu<IrqLock<TimerQueue>>,
    pub(crate) rcu: Rcu<Kernel<P>>,
    /// Bit per started CPU
    pub(crate) online: AtomicU64,
}

impl<P: Platform> Kernel<P> {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn cpu_id(&self) -> CpuId {
        self.platform.cpu_id()
    }

    pub fn rcu(&self) -> &Rcu<Kernel<P>> {
        &self.rcu
    }

    /// Number of live tasks, idle tasks included
    pub fn nr_tasks(&self) -> usize {
        self.tasks.lock(&self.platform).len()
    }
}

impl<P: Platform> Blocker for Kernel<P> {
    fn current_task(&self) -> TaskId {
        self.current_id()
    }

    fn task_name(&self, task: TaskId) -> TaskName {
        match self.task(task) {
            Some(t) => t.name().clone(),
            None => task_name("<reaped>"),
        }
    }

    fn blocking_ticket(&self) -> Ticket {
        self.sched_get_blocking_ticket()
    }

    fn sleep_until(&self, expiry: Option<u64>, state: SleepState, ticket: Ticket) {
        self.sched_timeout_ticket(expiry, state, ticket);
    }

    fn wake(&self, task: TaskId, ticket: Ticket) -> bool {
        self.sched_wake(task, ticket)
    }

    fn now_ns(&self) -> u64 {
        self.platform.now_ns()
    }

    fn has_pending_signal(&self) -> bool {
        self.platform.has_pending_signal(self.current_id())
    }

    fn disable_dpc(&self) {
        Kernel::disable_dpc(self);
    }

    fn enable_dpc(&self) {
        Kernel::enable_dpc(self);
    }
}
