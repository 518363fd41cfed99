//! Reaper
//!
//! An exiting task cannot free the stack it is running on. It becomes a
//! zombie, and once the switch away from it has finished, the CPU queues it
//! for the REAP DPC, which releases its platform context and its task slot.

use log::{debug, error};

use crate::kern::task::TaskState;
use crate::kernel::Kernel;
use crate::platform::Platform;

impl<P: Platform> Kernel<P> {
    /// REAP DPC
    pub(crate) fn reap_zombies(&self) {
        let cpu = self.cpu_id();
        loop {
            let Some(task) = self.cpus[cpu].reap_queue.lock().pop_front() else {
                break;
            };
            if task.state() != TaskState::Zombie {
                error!("{}: reap of {} in state {:?}", cpu, task, task.state());
                panic!("{} reaped twice", task);
            }
            task.set_state(TaskState::Reaped);
            self.tasks.lock(&self.platform).free(task.id().slot());
            self.platform.release_task(&task);
            debug!("{}: reaped {}", cpu, task);
        }
    }
}
