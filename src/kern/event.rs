//! Kernel events
//!
//! A one-shot flag that tasks can sleep on. `set` wakes every waiter and
//! leaves the event set until `reset`.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::kern::sched_prim::Blocker;
use crate::kern::task::SleepState;
use crate::types::{TaskId, Ticket};

struct EventWaiter {
    task: TaskId,
    ticket: AtomicU64,
    /// Cleared by `set` when it takes the waiter off the list
    queued: AtomicBool,
}

/// Settable event with sleeping waiters
pub struct Event {
    value: AtomicBool,
    waiters: spin::Mutex<VecDeque<Arc<EventWaiter>>>,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            value: AtomicBool::new(false),
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.value.store(false, Ordering::Release);
    }

    /// Sleep until the event is set
    pub fn wait<B: Blocker + ?Sized>(&self, blocker: &B) {
        if self.is_set() {
            return;
        }
        let waiter = Arc::new(EventWaiter {
            task: blocker.current_task(),
            ticket: AtomicU64::new(0),
            queued: AtomicBool::new(false),
        });
        loop {
            blocker.disable_dpc();
            let mut waiters = self.waiters.lock();
            if self.is_set() {
                if waiter.queued.load(Ordering::Acquire) {
                    waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                }
                drop(waiters);
                blocker.enable_dpc();
                return;
            }
            let ticket = blocker.blocking_ticket();
            waiter.ticket.store(ticket.0, Ordering::Relaxed);
            if !waiter.queued.swap(true, Ordering::AcqRel) {
                waiters.push_back(Arc::clone(&waiter));
            }
            drop(waiters);
            blocker.enable_dpc();

            blocker.sleep_until(None, SleepState::Uninterruptible, ticket);
            if !waiter.queued.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Set the event and wake all waiters
    pub fn set<B: Blocker + ?Sized>(&self, blocker: &B) {
        self.value.store(true, Ordering::Release);
        blocker.disable_dpc();
        let waiters = core::mem::take(&mut *self.waiters.lock());
        blocker.enable_dpc();
        for w in waiters {
            let ticket = Ticket(w.ticket.load(Ordering::Relaxed));
            w.queued.store(false, Ordering::Release);
            blocker.wake(w.task, ticket);
        }
    }

    /// Number of sleeping waiters
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
