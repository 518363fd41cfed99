//! Kernel Startup
//!
//! Bring-up happens in two phases. `Kernel::new` runs once on the boot CPU
//! and allocates every per-CPU structure, idle tasks included, so that no
//! CPU ever observes a half-built neighbour. `start_cpu` then runs on each
//! processor as it comes up: the calling context becomes that CPU's idle
//! task, the CPU joins the online mask and starts taking part in RCU grace
//! periods.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write;
use core::sync::atomic::{AtomicU64, Ordering};

use log::info;

use crate::config::KernelConfig;
use crate::error::KernError;
use crate::kern::dpc::CpuLocal;
use crate::kern::lock::IrqLock;
use crate::kern::percpu::PerCpu;
use crate::kern::rcu::Rcu;
use crate::kern::runq::RunQueue;
use crate::kern::task::Task;
use crate::kern::timer::TimerQueue;
use crate::kern::zalloc::Zone;
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::types::{CpuId, TaskId, TaskName};

fn idle_name(cpu: usize) -> TaskName {
    let mut name = TaskName::new();
    // "idle/63" always fits.
    let _ = write!(name, "idle/{}", cpu);
    name
}

impl<P: Platform> Kernel<P> {
    /// Phase one: allocate all kernel state for `config.nr_cpus` processors
    pub fn new(config: KernelConfig, platform: P) -> Result<Self, KernError> {
        config.validate()?;
        let nr_cpus = config.nr_cpus;

        let mut tasks = Zone::new("tasks", config.max_tasks);
        let mut idle = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let slot = tasks
                .alloc_with(|slot| {
                    Arc::new(Task::new_idle(TaskId::from_slot(slot), idle_name(cpu), CpuId(cpu as u32)))
                })
                .map_err(|_| KernError::OutOfTasks)?;
            idle.push(tasks.get(slot).cloned().ok_or(KernError::OutOfTasks)?);
        }

        let levels = config.priority_levels;
        let kernel = Self {
            config,
            platform,
            tasks: IrqLock::new(tasks),
            cpus: PerCpu::new(nr_cpus, |_| CpuLocal::new()),
            runqueues: PerCpu::new(nr_cpus, |cpu| {
                IrqLock::new(RunQueue::new(levels, Arc::clone(&idle[cpu.index()])))
            }),
            timers: PerCpu::new(nr_cpus, |_| IrqLock::new(TimerQueue::new())),
            rcu: Rcu::new(nr_cpus),
            online: AtomicU64::new(0),
        };
        info!(
            "kestrel: {} cpus, {} priority levels, {}ns timeslice",
            nr_cpus, levels, kernel.config.timeslice_ns
        );
        Ok(kernel)
    }

    /// Phase two: run on each CPU; the caller becomes the idle task
    pub fn start_cpu(&self) -> Result<(), KernError> {
        let cpu = self.cpu_id();
        if cpu.index() >= self.config.nr_cpus {
            return Err(KernError::InvalidCpu(cpu));
        }
        if self.is_online(cpu) {
            return Err(KernError::InvalidCpu(cpu));
        }
        let idle = Arc::clone(&self.runqueues[cpu].lock(&self.platform).idle);
        idle.on_cpu.store(cpu.0, Ordering::SeqCst);
        self.cpus[cpu].current.store(idle.id().0, Ordering::Relaxed);
        self.online.fetch_or(1u64 << cpu.index(), Ordering::AcqRel);
        self.rcu_enable();
        info!("{} online", cpu);
        Ok(())
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        cpu.index() < 64 && self.online.load(Ordering::Acquire) & (1u64 << cpu.index()) != 0
    }

    pub fn nr_online(&self) -> u32 {
        self.online.load(Ordering::Acquire).count_ones()
    }
}
