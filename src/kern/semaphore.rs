//! Counting semaphore
//!
//! The count and the waiter FIFO share one spin lock, taken with DPCs
//! disabled. Release with waiters queued never touches the count: the unit
//! goes straight to the head waiter, which finds `granted` set when it wakes.
//! The count is therefore never positive while anyone is queued.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::LockError;
use crate::kern::mutex::NO_TIMEOUT;
use crate::kern::sched_prim::{expiry_after, Blocker};
use crate::kern::task::SleepState;
use crate::types::{TaskId, Ticket};

struct SemaWaiter {
    task: TaskId,
    /// Ticket of the current sleep; rewritten under the semaphore lock
    ticket: AtomicU64,
    granted: AtomicBool,
}

struct SemaState {
    count: u32,
    waiters: VecDeque<Arc<SemaWaiter>>,
}

/// Counting semaphore with strict FIFO handoff
pub struct Semaphore {
    state: spin::Mutex<SemaState>,
}

impl Semaphore {
    pub const fn new(count: u32) -> Self {
        Self {
            state: spin::Mutex::new(SemaState {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Units available without sleeping
    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Number of queued waiters
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn lock<B: Blocker + ?Sized>(&self, blocker: &B) {
        if let Err(e) = self.acquire(blocker, false, NO_TIMEOUT) {
            unreachable!("uninterruptible semaphore wait without timeout failed: {}", e);
        }
    }

    pub fn lock_interruptible<B: Blocker + ?Sized>(&self, blocker: &B) -> Result<(), LockError> {
        self.acquire(blocker, true, NO_TIMEOUT)
    }

    /// Take a unit within `timeout_ns`; 0 only tries, `NO_TIMEOUT` waits forever
    pub fn lock_timeout<B: Blocker + ?Sized>(&self, blocker: &B, timeout_ns: u64) -> Result<(), LockError> {
        self.acquire(blocker, false, timeout_ns)
    }

    pub fn lock_timeout_interruptible<B: Blocker + ?Sized>(
        &self,
        blocker: &B,
        timeout_ns: u64,
    ) -> Result<(), LockError> {
        self.acquire(blocker, true, timeout_ns)
    }

    pub fn trylock<B: Blocker + ?Sized>(&self, blocker: &B) -> bool {
        blocker.disable_dpc();
        let mut state = self.state.lock();
        let taken = state.count > 0;
        if taken {
            state.count -= 1;
        }
        drop(state);
        blocker.enable_dpc();
        taken
    }

    fn acquire<B: Blocker + ?Sized>(&self, blocker: &B, interruptible: bool, timeout_ns: u64) -> Result<(), LockError> {
        let sleep_state = if interruptible {
            SleepState::Interruptible
        } else {
            SleepState::Uninterruptible
        };

        blocker.disable_dpc();
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            drop(state);
            blocker.enable_dpc();
            return Ok(());
        }
        if timeout_ns == 0 {
            drop(state);
            blocker.enable_dpc();
            return Err(LockError::WouldBlock);
        }
        let expiry = expiry_after(blocker.now_ns(), timeout_ns);
        let mut ticket = blocker.blocking_ticket();
        let waiter = Arc::new(SemaWaiter {
            task: blocker.current_task(),
            ticket: AtomicU64::new(ticket.0),
            granted: AtomicBool::new(false),
        });
        state.waiters.push_back(Arc::clone(&waiter));
        drop(state);
        blocker.enable_dpc();

        loop {
            blocker.sleep_until(expiry, sleep_state, ticket);
            if waiter.granted.load(Ordering::Acquire) {
                return Ok(());
            }

            let timed_out = expiry.is_some_and(|deadline| blocker.now_ns() >= deadline);
            let signalled = interruptible && blocker.has_pending_signal();

            blocker.disable_dpc();
            let mut state = self.state.lock();
            // A grant that raced with the timeout or signal wins.
            if waiter.granted.load(Ordering::Acquire) {
                drop(state);
                blocker.enable_dpc();
                return Ok(());
            }
            if timed_out || signalled {
                state.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                drop(state);
                blocker.enable_dpc();
                return Err(if timed_out {
                    LockError::TimedOut
                } else {
                    LockError::Interrupted
                });
            }
            ticket = blocker.blocking_ticket();
            waiter.ticket.store(ticket.0, Ordering::Relaxed);
            drop(state);
            blocker.enable_dpc();
        }
    }

    /// Return a unit, handing it to the oldest waiter if there is one
    pub fn unlock<B: Blocker + ?Sized>(&self, blocker: &B) {
        blocker.disable_dpc();
        let mut state = self.state.lock();
        let next = state.waiters.pop_front();
        let wake = match next {
            Some(w) => {
                w.granted.store(true, Ordering::Release);
                Some((w.task, Ticket(w.ticket.load(Ordering::Relaxed))))
            }
            None => {
                state.count = match state.count.checked_add(1) {
                    Some(count) => count,
                    None => panic!("semaphore count overflow"),
                };
                None
            }
        };
        drop(state);
        blocker.enable_dpc();
        if let Some((task, ticket)) = wake {
            blocker.wake(task, ticket);
        }
    }
}
