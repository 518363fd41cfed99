//! Zone Allocator
//!
//! A zone is a fixed-capacity pool of objects of one type. Allocation hands
//! out a slot index; the index doubles as the object's stable handle, which
//! is what lets a `TaskId` stand in for a task pointer.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use thiserror::Error;

// ============================================================================
// Zone Statistics
// ============================================================================

/// Zone statistics for debugging and monitoring
#[derive(Debug, Default)]
pub struct ZoneStats {
    /// Total allocations from this zone
    pub alloc_count: AtomicU64,
    /// Total deallocations to this zone
    pub free_count: AtomicU64,
    /// Current elements in use
    pub in_use: AtomicU32,
    /// Maximum elements ever in use
    pub max_in_use: AtomicU32,
    /// Failed allocation attempts
    pub failures: AtomicU32,
}

impl ZoneStats {
    pub fn record_alloc(&self) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        let in_use = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_use.fetch_max(in_use, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Zone
// ============================================================================

/// The zone has no free slot left
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("zone {name} exhausted ({capacity} elements)")]
pub struct ZoneFull {
    pub name: String,
    pub capacity: usize,
}

/// Fixed-capacity object pool
#[derive(Debug)]
pub struct Zone<T> {
    /// Zone name (for debugging)
    name: String,
    /// Slots; `None` is free
    slots: Vec<Option<T>>,
    /// Free slot indices, most recently freed last
    free: Vec<u32>,
    /// Hard limit on slots
    capacity: usize,
    /// Zone statistics
    pub stats: ZoneStats,
}

impl<T> Zone<T> {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: String::from(name),
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            stats: ZoneStats::default(),
        }
    }

    /// Store `value` in a free slot and return the slot index
    pub fn alloc(&mut self, value: T) -> Result<u32, ZoneFull> {
        self.alloc_with(|_| value)
    }

    /// Like `alloc`, for values that need to know their own slot index
    pub fn alloc_with(&mut self, make: impl FnOnce(u32) -> T) -> Result<u32, ZoneFull> {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
            None => {
                self.stats.record_failure();
                return Err(ZoneFull {
                    name: self.name.clone(),
                    capacity: self.capacity,
                });
            }
        };
        self.slots[idx as usize] = Some(make(idx));
        self.stats.record_alloc();
        Ok(idx)
    }

    /// Release a slot, returning what it held
    pub fn free(&mut self, idx: u32) -> Option<T> {
        let value = self.slots.get_mut(idx as usize)?.take()?;
        self.free.push(idx);
        self.stats.record_free();
        Some(value)
    }

    pub fn get(&self, idx: u32) -> Option<&T> {
        self.slots.get(idx as usize)?.as_ref()
    }

    /// Number of elements in use
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterate over occupied slots
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }
}
