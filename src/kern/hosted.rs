//! Hosted blocking backend
//!
//! Runs the sleeping locks on host threads: each registered thread acts as
//! a task, sleeping is `std::thread::park` and a wake is `unpark`. The
//! ticket protocol is the same as the kernel's, so a lock that works here
//! under real parallelism exercises the same handoff and cancellation paths.
//!
//! A thread registers once with `register`; the binding is thread-local, so
//! each thread should only be registered with one `ThreadBlocker`.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use std::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::trace;

use crate::kern::sched_prim::Blocker;
use crate::kern::task::SleepState;
use crate::types::{task_name, TaskId, TaskName, Ticket};

std::thread_local! {
    static CURRENT: Cell<Option<TaskId>> = const { Cell::new(None) };
}

struct HostTask {
    name: TaskName,
    thread: Thread,
    ticket: AtomicU64,
    woken: AtomicBool,
    signal: AtomicBool,
}

/// `Blocker` backed by host threads
pub struct ThreadBlocker {
    epoch: Instant,
    tasks: spin::RwLock<Vec<Arc<HostTask>>>,
}

impl ThreadBlocker {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            tasks: spin::RwLock::new(Vec::new()),
        }
    }

    /// Bind the calling thread to a new task
    pub fn register(&self, name: &str) -> TaskId {
        let mut tasks = self.tasks.write();
        tasks.push(Arc::new(HostTask {
            name: task_name(name),
            thread: thread::current(),
            ticket: AtomicU64::new(Ticket::INITIAL.0),
            woken: AtomicBool::new(false),
            signal: AtomicBool::new(false),
        }));
        let id = TaskId::from_slot((tasks.len() - 1) as u32);
        CURRENT.with(|c| c.set(Some(id)));
        trace!("registered {} as {}", name, id);
        id
    }

    /// Deliver a signal: interruptible sleeps of `task` end
    pub fn raise_signal(&self, task: TaskId) {
        let t = self.host_task(task);
        t.signal.store(true, Ordering::Release);
        t.woken.store(true, Ordering::Release);
        t.thread.unpark();
    }

    pub fn clear_signal(&self, task: TaskId) {
        self.host_task(task).signal.store(false, Ordering::Release);
    }

    fn host_task(&self, task: TaskId) -> Arc<HostTask> {
        match self.tasks.read().get(task.slot() as usize) {
            Some(t) => Arc::clone(t),
            None => panic!("{} is not registered", task),
        }
    }
}

impl Default for ThreadBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Blocker for ThreadBlocker {
    fn current_task(&self) -> TaskId {
        match CURRENT.with(|c| c.get()) {
            Some(id) => id,
            None => panic!("thread {:?} is not registered", thread::current().id()),
        }
    }

    fn task_name(&self, task: TaskId) -> TaskName {
        self.host_task(task).name.clone()
    }

    fn blocking_ticket(&self) -> Ticket {
        let me = self.host_task(self.current_task());
        Ticket(me.ticket.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn sleep_until(&self, expiry: Option<u64>, state: SleepState, ticket: Ticket) {
        let id = self.current_task();
        let me = self.host_task(id);
        loop {
            if me.woken.swap(false, Ordering::AcqRel) {
                return;
            }
            if state == SleepState::Interruptible && me.signal.load(Ordering::Acquire) {
                return;
            }
            match expiry {
                Some(deadline) => {
                    let now = self.now_ns();
                    if now >= deadline {
                        self.wake(id, ticket);
                        continue;
                    }
                    thread::park_timeout(Duration::from_nanos(deadline - now));
                }
                None => thread::park(),
            }
        }
    }

    fn wake(&self, task: TaskId, ticket: Ticket) -> bool {
        let t = self.host_task(task);
        if t
            .ticket
            .compare_exchange(ticket.0, ticket.0 + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        t.woken.store(true, Ordering::Release);
        t.thread.unpark();
        true
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn has_pending_signal(&self) -> bool {
        self.host_task(self.current_task()).signal.load(Ordering::Acquire)
    }

    fn disable_dpc(&self) {}

    fn enable_dpc(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::rcu::Rcu;
    use crate::types::CpuId;

    #[test]
    fn test_stale_ticket_does_not_wake() {
        let b = ThreadBlocker::new();
        let me = b.register("main");
        let old = b.blocking_ticket();
        let new = b.blocking_ticket();
        assert!(!b.wake(me, old));
        assert!(b.wake(me, new));
        // The wake is remembered; the sleep returns at once.
        b.sleep_until(None, SleepState::Uninterruptible, new);
    }

    #[test]
    fn test_sleep_times_out() {
        let b = ThreadBlocker::new();
        b.register("sleeper");
        let ticket = b.blocking_ticket();
        let start = b.now_ns();
        b.sleep_until(Some(start + 2_000_000), SleepState::Uninterruptible, ticket);
        assert!(b.now_ns() >= start + 2_000_000);
    }

    #[test]
    fn test_cross_thread_wake() {
        let b = Arc::new(ThreadBlocker::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let sleeper = {
            let b = Arc::clone(&b);
            thread::spawn(move || {
                let id = b.register("sleeper");
                let ticket = b.blocking_ticket();
                tx.send((id, ticket)).unwrap();
                b.sleep_until(None, SleepState::Uninterruptible, ticket);
            })
        };
        let (id, ticket) = rx.recv().unwrap();
        assert!(b.wake(id, ticket));
        sleeper.join().unwrap();
    }

    #[test]
    fn test_rcu_barrier_waits_for_callbacks() {
        let b = Arc::new(ThreadBlocker::new());
        let rcu = Arc::new(Rcu::<ThreadBlocker>::new(2));
        rcu.enable(CpuId(0));
        rcu.enable(CpuId(1));
        let stop = Arc::new(AtomicBool::new(false));

        // Two simulated CPUs keep passing through quiescent states.
        let driver = {
            let (b, rcu, stop) = (Arc::clone(&b), Arc::clone(&rcu), Arc::clone(&stop));
            thread::spawn(move || {
                b.register("rcu-driver");
                while !stop.load(Ordering::Acquire) {
                    for cpu in [CpuId(0), CpuId(1)] {
                        if rcu.quiesce(cpu) {
                            rcu.run_callbacks(cpu, &b);
                        }
                    }
                    thread::sleep(Duration::from_micros(100));
                }
            })
        };

        b.register("main");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        rcu.call(move |_| flag.store(true, Ordering::Release));
        rcu.barrier(&b);
        assert!(ran.load(Ordering::Acquire));

        stop.store(true, Ordering::Release);
        driver.join().unwrap();
    }
}
