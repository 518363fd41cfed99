//! Scheduling Primitives
//!
//! Task placement, the wake protocol, `schedule` and the second half of
//! every context switch.
//!
//! ## Wakeups
//!
//! A sleeper takes a ticket before it publishes itself anywhere a waker can
//! find it; a wake only counts if it consumes that exact ticket. The wake
//! then has to cope with the sleeper still running on its CPU (it has set a
//! sleeping state but not switched away yet). It leaves `pending_wakeup` set
//! and whoever observes the task off-CPU with the flag still set (the waker
//! or `finish_context_switch` on the sleeper's CPU) claims it with a
//! compare-and-swap and enqueues the task. Exactly one of them wins.
//!
//! ## Preemption
//!
//! A task enqueued on a CPU whose current priority is lower preempts it.
//! One enqueued at the same priority as the current task, on a level that
//! was empty, starts the round-robin timeslice. Remote CPUs learn about
//! either case through a reschedule IPI.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use log::{debug, trace, warn};

use crate::error::KernError;
use crate::kern::dpc::PendingWork;
use crate::kern::lock::IrqGuard;
use crate::kern::task::{SleepState, Task, TaskFlags, TaskState, NOT_RUNNING};
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::types::{task_name, CpuId, Priority, TaskId, TaskName, Ticket};

// ============================================================================
// Blocking interface
// ============================================================================

/// What a sleeping lock needs from its execution environment
///
/// The kernel implements this on top of the scheduler. `hosted::ThreadBlocker`
/// implements it with host threads so the lock algorithms can be exercised
/// under real parallelism.
pub trait Blocker: Sync {
    /// Task executing the caller
    fn current_task(&self) -> TaskId;

    /// Name of `task`, for diagnostics
    fn task_name(&self, task: TaskId) -> TaskName;

    /// Invalidate earlier wakes of the current task and return a new ticket
    fn blocking_ticket(&self) -> Ticket;

    /// Sleep until woken with `ticket` or until `expiry` (absolute ns) passes
    ///
    /// May return spuriously; callers re-check their condition.
    fn sleep_until(&self, expiry: Option<u64>, state: SleepState, ticket: Ticket);

    /// Wake `task` if it is still blocked on `ticket`
    fn wake(&self, task: TaskId, ticket: Ticket) -> bool;

    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Whether the current task has a signal that ends interruptible waits
    fn has_pending_signal(&self) -> bool;

    /// Enter a section that DPCs (and RCU grace periods) must not interrupt
    fn disable_dpc(&self);

    fn enable_dpc(&self);
}

/// Convert a relative timeout into an absolute expiry
///
/// `u64::MAX` means "wait forever".
pub(crate) fn expiry_after(now: u64, timeout_ns: u64) -> Option<u64> {
    if timeout_ns == u64::MAX {
        None
    } else {
        Some(now.saturating_add(timeout_ns))
    }
}

// ============================================================================
// Task lifecycle
// ============================================================================

impl<P: Platform> Kernel<P> {
    /// Allocate a task; it does not run until `start_task`
    pub fn create_task(&self, name: &str, priority: Priority, flags: TaskFlags) -> Result<TaskId, KernError> {
        if priority.level() >= self.config.priority_levels {
            return Err(KernError::InvalidPriority(priority.0));
        }
        let flags = flags - TaskFlags::IDLE;
        let cpu = self.cpu_id();
        let name = task_name(name);
        let task = {
            let mut tasks = self.tasks.lock(&self.platform);
            let slot = tasks
                .alloc_with(|slot| Arc::new(Task::new(TaskId::from_slot(slot), name, priority, flags, cpu)))
                .map_err(|e| {
                    warn!("create_task: {}", e);
                    KernError::OutOfTasks
                })?;
            tasks.get(slot).cloned().ok_or(KernError::OutOfTasks)?
        };
        if let Err(e) = self.platform.prepare_task(&task) {
            self.tasks.lock(&self.platform).free(task.id().slot());
            return Err(e);
        }
        debug!("created {} priority {}", task, priority.0);
        Ok(task.id())
    }

    /// Make a created task runnable
    pub fn start_task(&self, id: TaskId) -> Result<(), KernError> {
        let task = self.task(id).ok_or(KernError::NoSuchTask(id))?;
        if !self.sched_wake(id, Ticket::INITIAL) {
            warn!("{} already started", task);
        }
        Ok(())
    }

    /// Terminate the current task; returns only on the simulated platform
    pub fn exit_current(&self) {
        let me = self.current();
        assert!(!me.is_idle(), "{}: idle task cannot exit", self.cpu_id());
        debug!("{} exiting", me);
        self.disable_dpc();
        me.set_state(TaskState::Zombie);
        self.schedule_locked();
        self.enable_dpc();
    }

    /// Task handle, if the task exists and has not been reaped
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        if id.0 == 0 {
            return None;
        }
        self.tasks.lock(&self.platform).get(id.slot()).cloned()
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.task(id).map(|t| t.state())
    }

    // ========================================================================
    // Current task
    // ========================================================================

    /// Task executing on this CPU
    pub fn current(&self) -> Arc<Task> {
        let cpu = self.cpu_id();
        Arc::clone(&self.runqueues[cpu].lock(&self.platform).current)
    }

    pub fn current_id(&self) -> TaskId {
        let raw = self.local().current.load(Ordering::Relaxed);
        assert!(raw != 0, "{} has not been started", self.cpu_id());
        TaskId(raw)
    }

    /// Mark the current task as about to sleep; `schedule` does the rest
    pub fn set_current_state(&self, state: SleepState) {
        self.current().set_state(state.into());
    }

    /// Fresh blocking ticket for the current task
    pub fn sched_get_blocking_ticket(&self) -> Ticket {
        self.current().next_ticket()
    }

    /// Head of `cpu`'s run queue without dequeuing it
    pub fn pick_next_task(&self, cpu: CpuId) -> Option<TaskId> {
        self.runqueues[cpu]
            .lock(&self.platform)
            .peek_highest()
            .map(|t| t.id())
    }

    /// Runnable tasks assigned to `cpu`
    pub fn runqueue_load(&self, cpu: CpuId) -> usize {
        self.runqueues[cpu].lock(&self.platform).load
    }

    // ========================================================================
    // Wakeups
    // ========================================================================

    /// Wake `id` if it is blocked on `ticket`; false if the ticket is stale
    pub fn sched_wake(&self, id: TaskId, ticket: Ticket) -> bool {
        let Some(task) = self.task(id) else {
            return false;
        };
        if !task.claim_ticket(ticket) {
            return false;
        }
        self.disable_dpc();
        self.wake_task(task);
        self.enable_dpc();
        true
    }

    fn wake_task(&self, task: Arc<Task>) {
        task.pending_wakeup.store(true, Ordering::SeqCst);
        if task.on_cpu.load(Ordering::SeqCst) != NOT_RUNNING {
            // Still switching out; finish_context_switch will see the flag.
            return;
        }
        if matches!(task.state(), TaskState::Runnable | TaskState::Zombie | TaskState::Reaped) {
            return;
        }
        if task.on_cpu.load(Ordering::SeqCst) != NOT_RUNNING {
            return;
        }
        if task
            .pending_wakeup
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.enqueue_woken(task);
    }

    /// Place a task whose wakeup was just claimed
    fn enqueue_woken(&self, task: Arc<Task>) {
        let target = if task.flags().contains(TaskFlags::NOMIGRATE) {
            task.last_cpu()
        } else {
            self.find_least_loaded_cpu()
        };
        self.enqueue_on(target, task);
    }

    /// Online CPU with the lowest load, lowest number on ties
    pub fn find_least_loaded_cpu(&self) -> CpuId {
        let online = self.online.load(Ordering::Acquire);
        let mut best: Option<(CpuId, usize)> = None;
        for (cpu, rq) in self.runqueues.iter() {
            if online & (1u64 << cpu.index()) == 0 {
                continue;
            }
            let load = rq.lock(&self.platform).load;
            if best.map_or(true, |(_, l)| load < l) {
                best = Some((cpu, load));
            }
        }
        best.map_or_else(|| self.cpu_id(), |(cpu, _)| cpu)
    }

    fn enqueue_on(&self, cpu: CpuId, task: Arc<Task>) {
        let this = self.cpu_id();
        let mut rq = self.runqueues[cpu].lock(&self.platform);
        let priority = task.priority();
        let level_was_empty = rq.level_is_empty(priority);
        let prio = task.effective_priority();

        task.set_state(TaskState::Runnable);
        task.last_cpu.store(cpu.0, Ordering::Relaxed);
        trace!("enqueue {} on {}", task, cpu);
        rq.push(task);
        rq.load += 1;

        let preempts = prio > rq.current_priority;
        let shares = prio == rq.current_priority && level_was_empty;
        if cpu == this {
            if preempts {
                self.raise(cpu, PendingWork::RESCHEDULE);
            } else if shares {
                self.arm_timeslice(cpu, &mut rq.timeslice);
            }
        } else if preempts || shares {
            drop(rq);
            self.platform.send_reschedule_ipi(cpu);
        }
    }

    // ========================================================================
    // Context switching
    // ========================================================================

    /// Yield the CPU to the highest-priority runnable task
    pub fn schedule(&self) {
        self.disable_dpc();
        self.schedule_locked();
        self.enable_dpc();
    }

    /// `schedule` for callers that already run at DPC depth 1
    pub(crate) fn schedule_locked(&self) {
        let cpu = self.cpu_id();
        let _irq = IrqGuard::new(&self.platform);

        if self.rcu.quiesce(cpu) {
            self.raise(cpu, PendingWork::RCU);
        }
        self.cpus[cpu]
            .pending
            .fetch_and(!PendingWork::RESCHEDULE.bits(), Ordering::AcqRel);

        let mut rq = self.runqueues[cpu].lock(&self.platform);
        let prev = Arc::clone(&rq.current);
        if !prev.is_idle() {
            if prev.state() == TaskState::Runnable {
                rq.push(Arc::clone(&prev));
            } else {
                rq.load -= 1;
            }
        }

        let next = match rq.pop_highest() {
            Some(task) => task,
            None => Arc::clone(&rq.idle),
        };
        if Arc::ptr_eq(&prev, &next) {
            return;
        }

        rq.current_priority = next.effective_priority();
        next.on_cpu.store(cpu.0, Ordering::SeqCst);
        next.last_cpu.store(cpu.0, Ordering::Relaxed);
        if !next.is_idle() && !rq.level_is_empty(next.priority()) {
            self.arm_timeslice(cpu, &mut rq.timeslice);
        }
        rq.current = Arc::clone(&next);
        self.cpus[cpu].current.store(next.id().0, Ordering::Relaxed);
        drop(rq);

        trace!("{}: switch {} -> {}", cpu, prev, next);
        let prev = self.platform.context_switch(cpu, &prev, &next);
        self.finish_context_switch(prev);
    }

    /// Second half of a switch, run on behalf of the task switched to
    pub(crate) fn finish_context_switch(&self, prev: Arc<Task>) {
        match prev.state() {
            TaskState::Runnable => {
                prev.on_cpu.store(NOT_RUNNING, Ordering::SeqCst);
            }
            TaskState::Zombie => {
                prev.on_cpu.store(NOT_RUNNING, Ordering::SeqCst);
                let cpu = self.cpu_id();
                self.cpus[cpu].reap_queue.lock().push_back(prev);
                self.raise(cpu, PendingWork::REAP);
            }
            TaskState::Reaped => panic!("switched away from reaped {}", prev),
            TaskState::Interruptible | TaskState::Uninterruptible => {
                prev.on_cpu.store(NOT_RUNNING, Ordering::SeqCst);
                if prev
                    .pending_wakeup
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.enqueue_woken(prev);
                }
            }
        }
    }
}
