//! Timed sleeps
//!
//! The sleeper arms a one-shot wake timer on its own CPU before it gives up
//! the CPU and cancels it once it runs again. A timer that fires after the
//! task was woken some other way names a consumed ticket and does nothing.

use crate::kern::sched_prim::expiry_after;
use crate::kern::task::SleepState;
use crate::kern::timer::TimerCallback;
use crate::kernel::Kernel;
use crate::platform::Platform;
use crate::types::Ticket;

impl<P: Platform> Kernel<P> {
    /// Sleep on `ticket` until woken or until `expiry` (absolute ns)
    ///
    /// An expiry that has already passed returns at once without sleeping.
    pub fn sched_timeout_ticket(&self, expiry: Option<u64>, state: SleepState, ticket: Ticket) {
        if expiry.is_some_and(|deadline| deadline <= self.platform.now_ns()) {
            return;
        }
        assert!(!self.dpc_disabled(), "{}: sleeping with DPCs disabled", self.cpu_id());
        self.disable_dpc();
        let cpu = self.cpu_id();
        let me = self.current();
        let timer = expiry.map(|deadline| {
            self.arm_timer(
                cpu,
                deadline,
                TimerCallback::Wake {
                    task: me.id(),
                    ticket,
                },
            )
        });
        me.set_state(state.into());
        self.schedule_locked();
        if let Some(handle) = timer {
            self.cancel_timer(&handle);
        }
        self.enable_dpc();
    }

    /// Sleep with a fresh ticket
    pub fn sched_timeout(&self, expiry: Option<u64>, state: SleepState) {
        let ticket = self.sched_get_blocking_ticket();
        self.sched_timeout_ticket(expiry, state, ticket);
    }

    /// Sleep for `ns` nanoseconds unless woken earlier
    pub fn sleep_for(&self, ns: u64, state: SleepState) {
        let expiry = expiry_after(self.platform.now_ns(), ns);
        self.sched_timeout(expiry, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kern::task::{TaskFlags, TaskState};
    use crate::platform::sim::SimPlatform;
    use crate::types::{CpuId, Priority};

    fn boot_with_task() -> (Kernel<SimPlatform>, crate::types::TaskId) {
        let k = Kernel::new(KernelConfig::new().with_cpus(1), SimPlatform::new(1)).unwrap();
        k.start_cpu().unwrap();
        let a = k.create_task("A", Priority(4), TaskFlags::empty()).unwrap();
        k.start_task(a).unwrap();
        (k, a)
    }

    #[test]
    fn test_expired_deadline_does_not_sleep() {
        let (k, a) = boot_with_task();
        k.platform().advance(100);
        k.sched_timeout(Some(100), SleepState::Interruptible);
        assert_eq!(k.current_id(), a);
        assert_eq!(k.task_state(a), Some(TaskState::Runnable));
    }

    #[test]
    fn test_wake_timer_ends_sleep() {
        let (k, a) = boot_with_task();
        let ticket = k.sched_get_blocking_ticket();
        k.arm_timer(CpuId(0), 1_000, TimerCallback::Wake { task: a, ticket });
        assert_eq!(k.platform().programmed_timer(CpuId(0)), Some(1_000));
        k.set_current_state(SleepState::Uninterruptible);
        k.schedule();
        assert!(k.current().is_idle());

        k.platform().advance(999);
        k.timer_interrupt();
        assert!(k.current().is_idle());

        k.platform().advance(1);
        k.timer_interrupt();
        assert_eq!(k.current_id(), a);
    }

    #[test]
    fn test_stale_wake_timer_is_harmless() {
        let (k, a) = boot_with_task();
        let ticket = k.sched_get_blocking_ticket();
        k.arm_timer(CpuId(0), 50, TimerCallback::Wake { task: a, ticket });
        // Woken by someone else first; the task keeps running.
        assert!(k.sched_wake(a, ticket));
        k.platform().advance(50);
        k.timer_interrupt();
        assert_eq!(k.current_id(), a);
        assert_eq!(k.runqueue_load(CpuId(0)), 1);
    }
}
