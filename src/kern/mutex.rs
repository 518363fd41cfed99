//! Sleeping mutex
//!
//! The whole lock state is one word:
//!
//! ```text
//!   bits 63..2   owner task id (0 = unowned)
//!   bit  1       LOCK   - the waiter list is being modified
//!   bit  0       WAITER - the waiter list is non-empty
//! ```
//!
//! An uncontended acquire or release is a single compare-and-swap of the
//! whole word. The waiter list is a FIFO that is only touched by whoever set
//! LOCK. Release with waiters hands ownership straight to the head waiter,
//! so a task that wakes up finds the mutex already in its name.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::error;

use crate::error::LockError;
use crate::kern::sched_prim::{expiry_after, Blocker};
use crate::kern::task::SleepState;
use crate::types::{TaskId, Ticket};

const WAITER: usize = 1 << 0;
const LOCK: usize = 1 << 1;
const OWNER_SHIFT: usize = 2;

/// Timeout value meaning "no timeout"
pub const NO_TIMEOUT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct MutexWaiter {
    task: TaskId,
    ticket: Ticket,
}

fn owner_bits(task: TaskId) -> usize {
    task.as_usize() << OWNER_SHIFT
}

fn owner_of(word: usize) -> Option<TaskId> {
    match word >> OWNER_SHIFT {
        0 => None,
        raw => Some(TaskId(raw as u32)),
    }
}

/// Sleeping mutual-exclusion lock
pub struct Mutex {
    state: AtomicUsize,
    waiters: UnsafeCell<VecDeque<MutexWaiter>>,
}

// The waiter list is only accessed by the holder of the LOCK bit.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Current owner
    pub fn owner(&self) -> Option<TaskId> {
        owner_of(self.state.load(Ordering::Acquire))
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Whether tasks are queued for the mutex
    pub fn is_contended(&self) -> bool {
        self.state.load(Ordering::Acquire) & WAITER != 0
    }

    /// Acquire, sleeping uninterruptibly as long as it takes
    pub fn lock<B: Blocker + ?Sized>(&self, blocker: &B) {
        if let Err(e) = self.acquire(blocker, false, NO_TIMEOUT) {
            unreachable!("uninterruptible lock without timeout failed: {}", e);
        }
    }

    /// Acquire unless a signal arrives first
    pub fn lock_interruptible<B: Blocker + ?Sized>(&self, blocker: &B) -> Result<(), LockError> {
        self.acquire(blocker, true, NO_TIMEOUT)
    }

    /// Acquire within `timeout_ns`; 0 only tries, `NO_TIMEOUT` waits forever
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

    /// Acquire only if that needs no sleeping
    pub fn trylock<B: Blocker + ?Sized>(&self, blocker: &B) -> bool {
        let me = blocker.current_task();
        let bits = owner_bits(me);
        if self
            .state
            .compare_exchange(0, bits, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
        loop {
            let word = self.state.load(Ordering::Relaxed);
            if word & LOCK != 0 {
                spin_loop();
                continue;
            }
            match owner_of(word) {
                Some(owner) if owner == me => self.recursive_acquire(blocker, me),
                Some(_) => return false,
                None => {
                    if self
                        .state
                        .compare_exchange(word, bits | (word & WAITER), Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    fn acquire<B: Blocker + ?Sized>(&self, blocker: &B, interruptible: bool, timeout_ns: u64) -> Result<(), LockError> {
        if timeout_ns == 0 {
            return if self.trylock(blocker) {
                Ok(())
            } else {
                Err(LockError::WouldBlock)
            };
        }
        let me = blocker.current_task();
        if self
            .state
            .compare_exchange(0, owner_bits(me), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
        let expiry = expiry_after(blocker.now_ns(), timeout_ns);
        self.lock_slowpath(blocker, me, interruptible, expiry)
    }

    fn give_up<B: Blocker + ?Sized>(blocker: &B, interruptible: bool, expiry: Option<u64>) -> Option<LockError> {
        if expiry.is_some_and(|deadline| blocker.now_ns() >= deadline) {
            return Some(LockError::TimedOut);
        }
        if interruptible && blocker.has_pending_signal() {
            return Some(LockError::Interrupted);
        }
        None
    }

    fn lock_slowpath<B: Blocker + ?Sized>(
        &self,
        blocker: &B,
        me: TaskId,
        interruptible: bool,
        expiry: Option<u64>,
    ) -> Result<(), LockError> {
        let bits = owner_bits(me);
        let state = if interruptible {
            SleepState::Interruptible
        } else {
            SleepState::Uninterruptible
        };

        // Queue up, unless the mutex was released in the meantime.
        let mut ticket = loop {
            let word = self.state.load(Ordering::Relaxed);
            if word & LOCK != 0 {
                spin_loop();
                continue;
            }
            match owner_of(word) {
                None => {
                    if self
                        .state
                        .compare_exchange(word, bits | (word & WAITER), Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        return Ok(());
                    }
                    continue;
                }
                Some(owner) if owner == me => self.recursive_acquire(blocker, me),
                Some(_) => {}
            }
            if let Some(err) = Self::give_up(blocker, interruptible, expiry) {
                return Err(err);
            }
            blocker.disable_dpc();
            if self
                .state
                .compare_exchange(word, word | LOCK, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                blocker.enable_dpc();
                continue;
            }
            let ticket = blocker.blocking_ticket();
            // SAFETY: we hold LOCK.
            unsafe { (*self.waiters.get()).push_back(MutexWaiter { task: me, ticket }) };
            self.state.store(word | WAITER, Ordering::Release);
            blocker.enable_dpc();
            break ticket;
        };

        // Sleep until the owner hands the mutex over.
        loop {
            blocker.sleep_until(expiry, state, ticket);
            loop {
                let word = self.state.load(Ordering::Acquire);
                if owner_of(word) == Some(me) {
                    return Ok(());
                }
                if word & LOCK != 0 {
                    spin_loop();
                    continue;
                }
                blocker.disable_dpc();
                if self
                    .state
                    .compare_exchange(word, word | LOCK, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    blocker.enable_dpc();
                    continue;
                }
                // SAFETY: we hold LOCK.
                let waiters = unsafe { &mut *self.waiters.get() };
                if owner_of(word).is_none() {
                    waiters.retain(|w| w.task != me);
                    let rest = if waiters.is_empty() { 0 } else { WAITER };
                    self.state.store(bits | rest, Ordering::Release);
                    blocker.enable_dpc();
                    return Ok(());
                }
                if let Some(err) = Self::give_up(blocker, interruptible, expiry) {
                    waiters.retain(|w| w.task != me);
                    let mut next = word;
                    if waiters.is_empty() {
                        next &= !WAITER;
                    }
                    self.state.store(next, Ordering::Release);
                    blocker.enable_dpc();
                    return Err(err);
                }
                ticket = blocker.blocking_ticket();
                if let Some(w) = waiters.iter_mut().find(|w| w.task == me) {
                    w.ticket = ticket;
                }
                self.state.store(word, Ordering::Release);
                blocker.enable_dpc();
                break;
            }
        }
    }

    /// Release; the caller must be the owner
    pub fn unlock<B: Blocker + ?Sized>(&self, blocker: &B) {
        let me = blocker.current_task();
        let bits = owner_bits(me);
        if self
            .state
            .compare_exchange(bits, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        loop {
            let word = self.state.load(Ordering::Relaxed);
            if owner_of(word) != Some(me) {
                self.bad_release(blocker, me, owner_of(word));
            }
            if word & LOCK != 0 {
                spin_loop();
                continue;
            }
            if word & WAITER == 0 {
                if self
                    .state
                    .compare_exchange(word, 0, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            blocker.disable_dpc();
            if self
                .state
                .compare_exchange(word, word | LOCK, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                blocker.enable_dpc();
                continue;
            }
            // SAFETY: we hold LOCK.
            let waiters = unsafe { &mut *self.waiters.get() };
            let Some(next) = waiters.pop_front() else {
                panic!("mutex has WAITER set but no waiters");
            };
            let rest = if waiters.is_empty() { 0 } else { WAITER };
            self.state.store(owner_bits(next.task) | rest, Ordering::Release);
            blocker.enable_dpc();
            blocker.wake(next.task, next.ticket);
            return;
        }
    }

    fn recursive_acquire<B: Blocker + ?Sized>(&self, blocker: &B, me: TaskId) -> ! {
        let name = blocker.task_name(me);
        error!("{} ({}) tried to acquire a mutex it holds", name, me);
        panic!("recursive mutex acquire by {}", name);
    }

    fn bad_release<B: Blocker + ?Sized>(&self, blocker: &B, me: TaskId, owner: Option<TaskId>) -> ! {
        let name = blocker.task_name(me);
        match owner {
            Some(owner) => {
                let owner_name = blocker.task_name(owner);
                error!("{} released a mutex held by {}", name, owner_name);
                panic!("mutex released by {} but held by {}", name, owner_name);
            }
            None => {
                error!("{} released an unlocked mutex", name);
                panic!("mutex released by {} but not held", name);
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::hosted::ThreadBlocker;
    use crate::kern::task::TaskFlags;
    use crate::config::KernelConfig;
    use crate::kernel::Kernel;
    use crate::platform::sim::SimPlatform;
    use crate::types::Priority;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_uncontended_on_kernel() {
        let k = Kernel::new(KernelConfig::new().with_cpus(1), SimPlatform::new(1)).unwrap();
        k.start_cpu().unwrap();
        let a = k.create_task("A", Priority(3), TaskFlags::empty()).unwrap();
        k.start_task(a).unwrap();

        let m = Mutex::new();
        assert!(m.trylock(&k));
        assert_eq!(m.owner(), Some(a));
        m.unlock(&k);
        assert!(!m.is_locked());
        assert_eq!(m.lock_timeout(&k, 0), Ok(()));
        m.unlock(&k);
        m.lock(&k);
        assert!(m.is_locked());
        m.unlock(&k);
        assert!(!m.is_contended());
    }

    #[test]
    fn test_mutual_exclusion() {
        let b = Arc::new(ThreadBlocker::new());
        let m = Arc::new(Mutex::new());
        let counter = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (b, m, counter) = (Arc::clone(&b), Arc::clone(&m), Arc::clone(&counter));
                thread::spawn(move || {
                    b.register(&std::format!("worker{}", i));
                    for _ in 0..2000 {
                        m.lock(&*b);
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        m.unlock(&*b);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
        assert!(!m.is_locked());
        assert!(!m.is_contended());
    }

    #[test]
    fn test_unlock_hands_off_to_waiter() {
        let b = Arc::new(ThreadBlocker::new());
        let m = Arc::new(Mutex::new());
        let owner = b.register("owner");
        m.lock(&*b);

        let (id_tx, id_rx) = std::sync::mpsc::channel();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let waiter = {
            let (b, m) = (Arc::clone(&b), Arc::clone(&m));
            thread::spawn(move || {
                id_tx.send(b.register("waiter")).unwrap();
                m.lock(&*b);
                go_rx.recv().unwrap();
                m.unlock(&*b);
            })
        };
        let waiter_id = id_rx.recv().unwrap();
        wait_until(|| m.is_contended());

        m.unlock(&*b);
        assert_eq!(m.owner(), Some(waiter_id));
        assert_ne!(m.owner(), Some(owner));
        assert!(!m.is_contended());

        go_tx.send(()).unwrap();
        waiter.join().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn test_trylock_fails_when_held() {
        let b = Arc::new(ThreadBlocker::new());
        let m = Arc::new(Mutex::new());
        b.register("holder");
        m.lock(&*b);
        let contender = {
            let (b, m) = (Arc::clone(&b), Arc::clone(&m));
            thread::spawn(move || {
                b.register("contender");
                (m.trylock(&*b), m.lock_timeout(&*b, 0))
            })
        };
        assert_eq!(contender.join().unwrap(), (false, Err(LockError::WouldBlock)));
        m.unlock(&*b);
    }

    #[test]
    fn test_lock_timeout_expires() {
        let b = Arc::new(ThreadBlocker::new());
        let m = Arc::new(Mutex::new());
        let holder = b.register("holder");
        m.lock(&*b);
        let contender = {
            let (b, m) = (Arc::clone(&b), Arc::clone(&m));
            thread::spawn(move || {
                b.register("contender");
                m.lock_timeout(&*b, 5_000_000)
            })
        };
        assert_eq!(contender.join().unwrap(), Err(LockError::TimedOut));
        assert_eq!(m.owner(), Some(holder));
        assert!(!m.is_contended());
        m.unlock(&*b);
        assert!(!m.is_locked());
    }

    #[test]
    fn test_signal_interrupts_waiter() {
        let b = Arc::new(ThreadBlocker::new());
        let m = Arc::new(Mutex::new());
        let holder = b.register("holder");
        m.lock(&*b);
        let (tx, rx) = std::sync::mpsc::channel();
        let contender = {
            let (b, m) = (Arc::clone(&b), Arc::clone(&m));
            thread::spawn(move || {
                tx.send(b.register("contender")).unwrap();
                m.lock_interruptible(&*b)
            })
        };
        let id = rx.recv().unwrap();
        wait_until(|| m.is_contended());
        b.raise_signal(id);
        assert_eq!(contender.join().unwrap(), Err(LockError::Interrupted));
        assert_eq!(m.owner(), Some(holder));
        assert!(!m.is_contended());
        m.unlock(&*b);
    }

    #[test]
    #[should_panic(expected = "mutex released by intruder but held by holder")]
    fn test_unlock_by_non_owner_panics() {
        let b = Arc::new(ThreadBlocker::new());
        let m = Arc::new(Mutex::new());
        {
            let (b, m) = (Arc::clone(&b), Arc::clone(&m));
            thread::spawn(move || {
                b.register("holder");
                m.lock(&*b);
            })
            .join()
            .unwrap();
        }
        b.register("intruder");
        m.unlock(&*b);
    }

    #[test]
    #[should_panic(expected = "recursive mutex acquire by main")]
    fn test_recursive_lock_panics() {
        let b = Arc::new(ThreadBlocker::new());
        b.register("main");
        let m = Mutex::new();
        m.lock(&*b);
        m.lock(&*b);
    }
}
