//! Interrupt-safe spin locks
//!
//! Structures that interrupt handlers also touch (runqueues, timer queues)
//! are guarded by spin locks that are only taken with interrupts disabled,
//! otherwise an interrupt arriving on the holder's CPU would deadlock on it.
//!
//! Provides:
//! - `IrqControl`: save/restore of the local interrupt-enable state
//! - `IrqLock<T>`: a `spin::Mutex` taken with interrupts disabled
//! - `IrqGuard`: interrupts-off section without a lock

use core::ops::{Deref, DerefMut};

// ============================================================================
// Interrupt Control
// ============================================================================

/// Local interrupt masking, provided by the architecture
pub trait IrqControl {
    /// Disable interrupts on this CPU, returning whether they were enabled
    fn irq_save(&self) -> bool;

    /// Restore the interrupt state returned by `irq_save`
    fn irq_restore(&self, was_enabled: bool);
}

/// Interrupts stay disabled for the guard's lifetime
pub struct IrqGuard<'a> {
    irq: &'a dyn IrqControl,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    pub fn new(irq: &'a dyn IrqControl) -> Self {
        let was_enabled = irq.irq_save();
        Self { irq, was_enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.irq.irq_restore(self.was_enabled);
    }
}

// ============================================================================
// IRQ-safe Lock
// ============================================================================

/// A spin lock that is always taken with interrupts disabled
#[derive(Debug, Default)]
pub struct IrqLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Disable interrupts, then spin for the lock
    pub fn lock<'a>(&'a self, irq: &'a dyn IrqControl) -> IrqLockGuard<'a, T> {
        let irq_guard = IrqGuard::new(irq);
        let guard = self.inner.lock();
        IrqLockGuard {
            guard,
            _irq: irq_guard,
        }
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard for `IrqLock`; releases the lock before restoring interrupts
pub struct IrqLockGuard<'a, T> {
    // Field order matters: the lock must be dropped before `_irq`.
    guard: spin::MutexGuard<'a, T>,
    _irq: IrqGuard<'a>,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
