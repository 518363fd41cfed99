//! Kern subsystem - core kernel primitives
//!
//! Scheduling, deferred work, timers, RCU and the sleeping locks built on
//! top of them. Most operations are methods on [`crate::kernel::Kernel`],
//! spread over the modules that own each concern.

pub mod dpc;
pub mod event;
#[cfg(any(test, feature = "std"))]
pub mod hosted;
pub mod idle;
pub mod lock;
pub mod mutex;
pub mod percpu;
pub mod rcu;
pub mod reaper;
pub mod refcount;
pub mod runq;
pub mod sched_prim;
pub mod semaphore;
pub mod sleep;
pub mod startup;
pub mod task;
pub mod timer;
pub mod zalloc;

pub use dpc::{CpuLocal, PendingWork};
pub use event::Event;
#[cfg(any(test, feature = "std"))]
pub use hosted::ThreadBlocker;
pub use lock::{IrqControl, IrqGuard, IrqLock};
pub use mutex::{Mutex, NO_TIMEOUT};
pub use percpu::{CacheAligned, PerCpu};
pub use rcu::{Rcu, RcuCallback};
pub use refcount::RefCount;
pub use runq::RunQueue;
pub use sched_prim::Blocker;
pub use semaphore::Semaphore;
pub use task::{SleepState, Task, TaskFlags, TaskState};
pub use timer::{TimerCallback, TimerHandle, TimerQueue};
pub use zalloc::{Zone, ZoneFull, ZoneStats};
