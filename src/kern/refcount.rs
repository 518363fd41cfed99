//! Reference counts
//!
//! Atomic object counts shared by the scheduler and the memory manager.

use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// Atomic reference count
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    pub const fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    /// Current count (racy unless the caller excludes updates)
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Take another reference; the caller must already hold one
    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a reference unless the object is already dying
    ///
    /// This is the lookup path for objects found under `rcu_read_lock`.
    pub fn inc_not_zero(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop a reference; returns true if it was the last one
    pub fn dec(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::Release);
        if old == 0 {
            panic!("refcount underflow");
        }
        if old == 1 {
            fence(Ordering::Acquire);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refcount_lifecycle() {
        let r = RefCount::new(1);
        r.inc();
        assert_eq!(r.get(), 2);
        assert!(!r.dec());
        assert!(r.dec());
        assert_eq!(r.get(), 0);
    }

    #[test]
    fn test_inc_not_zero() {
        let r = RefCount::new(1);
        assert!(r.inc_not_zero());
        assert!(!r.dec());
        assert!(r.dec());
        assert!(!r.inc_not_zero());
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn test_underflow_panics() {
        let r = RefCount::new(0);
        r.dec();
    }
}
