//! Per-CPU containers
//!
//! Every per-CPU structure is allocated for all processors up front, before
//! any processor is started, and then indexed by `CpuId`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Deref, Index};

use crate::types::CpuId;

/// Cache-line aligned wrapper so neighbouring CPUs do not share a line
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T>(pub T);

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// One `T` per processor
#[derive(Debug)]
pub struct PerCpu<T> {
    slots: Box<[CacheAligned<T>]>,
}

impl<T> PerCpu<T> {
    /// Allocate a slot for each of `nr_cpus` processors
    pub fn new(nr_cpus: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        let slots: Vec<CacheAligned<T>> = (0..nr_cpus)
            .map(|i| CacheAligned(init(CpuId(i as u32))))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, cpu: CpuId) -> Option<&T> {
        self.slots.get(cpu.index()).map(|s| &s.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (CpuId(i as u32), &s.0))
    }
}

impl<T> Index<CpuId> for PerCpu<T> {
    type Output = T;

    fn index(&self, cpu: CpuId) -> &T {
        match self.slots.get(cpu.index()) {
            Some(slot) => &slot.0,
            None => panic!("{} has no per-cpu slot ({} allocated)", cpu, self.slots.len()),
        }
    }
}
