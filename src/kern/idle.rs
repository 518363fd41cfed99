//! Idle loop
//!
//! Each CPU's idle task halts when there is nothing to run. A halted CPU
//! drops out of RCU for the duration so it cannot hold up grace periods.

use crate::kernel::Kernel;
use crate::platform::Platform;

impl<P: Platform> Kernel<P> {
    /// One pass of the idle loop
    pub fn idle_once(&self) {
        self.schedule();

        self.disable_dpc();
        self.rcu_disable();
        if !self.local().pending().is_empty() {
            self.rcu_enable();
            self.enable_dpc();
            return;
        }
        self.platform.wait_for_interrupt();
        self.rcu_enable();
        self.enable_dpc();
    }

    /// Body of every idle task
    pub fn idle_loop(&self) -> ! {
        loop {
            self.idle_once();
        }
    }
}
