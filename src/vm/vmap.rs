//! Kernel virtual area allocator
//!
//! Hands out page-granular ranges of the kernel's virtual window for large
//! allocations and device mappings. Every area is surrounded by at least one
//! unmapped guard page on each side, so running off either end of an area
//! faults instead of corrupting a neighbour. Page table population is the
//! caller's business; this only tracks which ranges are taken.

use log::trace;

use crate::config::PAGE_SIZE;
use crate::error::VmError;
use crate::vm::vma_tree::{align_up, VmaTree, VMA_TREE_MAX};

/// Guard space left free below and above every area
const GUARD: u64 = PAGE_SIZE;

/// What backs a vmap area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmapKind {
    /// Fresh kernel memory
    Anonymous,
    /// Device memory starting at page-aligned physical address `phys`
    Io { phys: u64 },
}

/// One allocated area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmapArea {
    pub first: u64,
    pub last: u64,
    pub kind: VmapKind,
}

impl VmapArea {
    pub fn size(&self) -> u64 {
        self.last - self.first + 1
    }
}

/// Allocator for one kernel virtual window
pub struct VmapSpace {
    first: u64,
    last: u64,
    tree: spin::Mutex<VmaTree<VmapKind>>,
}

impl VmapSpace {
    /// Manage `[first, last]`; both ends must be page boundaries
    pub fn new(first: u64, last: u64) -> Self {
        assert!(
            first % PAGE_SIZE == 0 && last % PAGE_SIZE == PAGE_SIZE - 1 && first < last,
            "bad vmap window {:#x}..={:#x}",
            first,
            last
        );
        Self {
            first,
            last,
            tree: spin::Mutex::new(VmaTree::new()),
        }
    }

    /// Allocate `size` bytes (rounded up to pages) anywhere in the window
    pub fn alloc(&self, size: u64) -> Result<u64, VmError> {
        self.alloc_range(size, self.first, self.last)
    }

    /// Allocate `size` bytes (rounded up to pages) inside `[low, high]`
    pub fn alloc_range(&self, size: u64, low: u64, high: u64) -> Result<u64, VmError> {
        self.insert(size, low, high, VmapKind::Anonymous)
    }

    /// Reserve a range for device memory at `phys`
    ///
    /// The returned address has the same offset within its page as `phys`.
    pub fn map_io(&self, phys: u64, size: u64) -> Result<u64, VmError> {
        let offset = phys & (PAGE_SIZE - 1);
        let size = size.checked_add(offset).ok_or(VmError::InvalidRange)?;
        let addr = self.insert(size, self.first, self.last, VmapKind::Io { phys: phys - offset })?;
        Ok(addr + offset)
    }

    fn insert(&self, size: u64, low: u64, high: u64, kind: VmapKind) -> Result<u64, VmError> {
        let size = match align_up(size, PAGE_SIZE) {
            Some(0) | None => return Err(VmError::InvalidRange),
            Some(size) => size,
        };
        if low < self.first || high > self.last || low > high {
            return Err(VmError::InvalidRange);
        }
        let mut tree = self.tree.lock();
        let addr = find_free_with_guard(&tree, size, low, high).ok_or(VmError::NoSpace)?;
        tree.insert(addr, addr + size - 1, kind);
        trace!("vmap: {:#x}..={:#x} {:?}", addr, addr + size - 1, kind);
        Ok(addr)
    }

    /// Release the area containing `addr`
    pub fn free(&self, addr: u64) -> Result<VmapArea, VmError> {
        let mut tree = self.tree.lock();
        let id = tree.find(addr).ok_or(VmError::NotMapped(addr))?;
        let (first, last) = tree.range(id);
        let kind = tree.remove(id);
        trace!("vunmap: {:#x}..={:#x}", first, last);
        Ok(VmapArea { first, last, kind })
    }

    /// Area containing `addr`
    pub fn area_of(&self, addr: u64) -> Option<VmapArea> {
        let tree = self.tree.lock();
        let id = tree.find(addr)?;
        let (first, last) = tree.range(id);
        Some(VmapArea {
            first,
            last,
            kind: *tree.get(id),
        })
    }

    /// Bytes currently allocated, guard pages not included
    pub fn used(&self) -> u64 {
        self.tree.lock().iter().map(|e| e.last - e.first + 1).sum()
    }

    pub fn len(&self) -> usize {
        self.tree.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.lock().is_empty()
    }
}

/// Lowest page-aligned `size`-byte range in `[low, high]` with a free guard
/// page on each side
///
/// The guards may lie just outside `[low, high]`, so the search window is
/// widened by one guard at each end.
fn find_free_with_guard(tree: &VmaTree<VmapKind>, size: u64, low: u64, high: u64) -> Option<u64> {
    let hole = size.checked_add(2 * GUARD)?;
    let low = low.saturating_sub(GUARD);
    let high = if high < VMA_TREE_MAX - GUARD {
        high + GUARD
    } else {
        VMA_TREE_MAX
    };
    tree.find_free_bottomup(hole, PAGE_SIZE, low, high)
        .map(|addr| addr + GUARD)
}
