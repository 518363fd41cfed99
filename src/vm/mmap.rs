//! User address-space layout
//!
//! An `AddressSpace` tracks the mapped ranges of one user process in a
//! `VmaTree`. Free-range searches run inside the mmap window
//! `[mmap_base, mmap_end)` and are page granular: the alignment is never
//! below `PAGE_SIZE`, and the window start is aligned up before searching.

use core::cmp::max;

use bitflags::bitflags;
use log::trace;

use crate::config::PAGE_SIZE;
use crate::error::VmError;
use crate::kern::refcount::RefCount;
use crate::vm::vma_tree::{align_up, InvariantViolation, Iter, VmaEntry, VmaTree};

bitflags! {
    /// Access rights of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmaProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// Per-mapping data kept in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub prot: VmaProt,
}

/// Mapped ranges of one user process
#[derive(Debug)]
pub struct AddressSpace {
    vmas: VmaTree<Vma>,
    mmap_base: u64,
    mmap_end: u64,
    topdown: bool,
    users: RefCount,
}

impl AddressSpace {
    /// Empty address space with mmap window `[mmap_base, mmap_end)`
    ///
    /// Starts with one user and top-down placement.
    pub fn new(mmap_base: u64, mmap_end: u64) -> Self {
        assert!(
            mmap_base % PAGE_SIZE == 0 && mmap_end % PAGE_SIZE == 0 && mmap_base < mmap_end,
            "bad mmap window {:#x}..{:#x}",
            mmap_base,
            mmap_end
        );
        Self {
            vmas: VmaTree::new(),
            mmap_base,
            mmap_end,
            topdown: true,
            users: RefCount::new(1),
        }
    }

    /// Choose where unhinted mappings go
    pub fn set_topdown(&mut self, topdown: bool) {
        self.topdown = topdown;
    }

    pub fn mmap_base(&self) -> u64 {
        self.mmap_base
    }

    pub fn mmap_end(&self) -> u64 {
        self.mmap_end
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    /// Take a user reference
    pub fn get(&self) {
        self.users.inc();
    }

    /// Drop a user reference; true if it was the last
    pub fn put(&self) -> bool {
        self.users.dec()
    }

    pub fn users(&self) -> usize {
        self.users.get()
    }

    // ------------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------------

    /// Free `size`-byte range in the mmap window
    pub fn get_unmapped_area(&self, size: u64, align: u64, topdown: bool) -> Result<u64, VmError> {
        if size == 0 {
            return Err(VmError::InvalidRange);
        }
        let align = max(align, PAGE_SIZE);
        if !align.is_power_of_two() {
            return Err(VmError::InvalidRange);
        }
        let start = align_up(self.mmap_base, align).ok_or(VmError::NoSpace)?;
        let end = self.mmap_end;
        if end <= start || end - start < size {
            return Err(VmError::NoSpace);
        }
        let found = if topdown {
            self.vmas.find_free_topdown(size, align, start, end - 1)
        } else {
            self.vmas.find_free_bottomup(size, align, start, end - 1)
        };
        found.ok_or(VmError::NoSpace)
    }

    /// Map `size` bytes (rounded up to pages)
    ///
    /// A fixed mapping goes exactly at `hint` and must not overlap anything.
    /// Otherwise `hint` is used when it is free, and a free range is
    /// searched for when it is not.
    pub fn map(&mut self, hint: Option<u64>, size: u64, prot: VmaProt, fixed: bool) -> Result<u64, VmError> {
        let size = page_round(size)?;
        let addr = match hint {
            Some(addr) if fixed => {
                let last = self.check_range(addr, size)?;
                if let Some((first, end)) = self.first_overlap(addr, last) {
                    return Err(VmError::Overlap { first, last: end });
                }
                addr
            }
            None if fixed => return Err(VmError::InvalidRange),
            Some(addr) if self.is_free(addr, size) => addr,
            _ => self.get_unmapped_area(size, PAGE_SIZE, self.topdown)?,
        };
        self.vmas.insert(addr, addr + size - 1, Vma { prot });
        trace!("mmap {:#x}..={:#x} {:?}", addr, addr + size - 1, prot);
        Ok(addr)
    }

    /// Unmap every page in `[addr, addr + size)`
    ///
    /// Mappings that straddle either end are trimmed; one that covers the
    /// whole range is split in two. Unmapping a hole is not an error.
    pub fn unmap(&mut self, addr: u64, size: u64) -> Result<(), VmError> {
        let last = self.check_range(addr, page_round(size)?)?;
        let mut cur = self.vmas.find_above(addr);
        while let Some(id) = cur {
            let (first, end) = self.vmas.range(id);
            if first > last {
                break;
            }
            cur = self.vmas.next(id);
            match (first < addr, end > last) {
                (true, true) => {
                    let vma = *self.vmas.get(id);
                    self.vmas.adjust(id, first, addr - 1);
                    self.vmas.insert(last + 1, end, vma);
                }
                (true, false) => self.vmas.adjust(id, first, addr - 1),
                (false, true) => self.vmas.adjust(id, last + 1, end),
                (false, false) => {
                    self.vmas.remove(id);
                }
            }
        }
        trace!("munmap {:#x}..={:#x}", addr, last);
        Ok(())
    }

    /// Change the protection of `[addr, addr + size)`, which must be mapped
    pub fn protect(&mut self, addr: u64, size: u64, prot: VmaProt) -> Result<(), VmError> {
        let last = self.check_range(addr, page_round(size)?)?;

        let mut expect = addr;
        let mut cur = self.vmas.find_above(addr);
        while let Some(id) = cur {
            let (first, end) = self.vmas.range(id);
            if first > last {
                break;
            }
            if first > expect {
                return Err(VmError::NotMapped(expect));
            }
            expect = end + 1;
            cur = self.vmas.next(id);
        }
        if expect <= last {
            return Err(VmError::NotMapped(expect));
        }

        self.split_at(addr);
        self.split_at(last + 1);
        let mut cur = self.vmas.find(addr);
        while let Some(id) = cur {
            if self.vmas.range(id).0 > last {
                break;
            }
            self.vmas.get_mut(id).prot = prot;
            cur = self.vmas.next(id);
        }
        Ok(())
    }

    /// Mapping containing `addr`
    pub fn find_vma(&self, addr: u64) -> Option<VmaEntry<'_, Vma>> {
        let id = self.vmas.find(addr)?;
        let (first, last) = self.vmas.range(id);
        Some(VmaEntry {
            id,
            first,
            last,
            value: self.vmas.get(id),
        })
    }

    /// Mappings in ascending address order
    pub fn iter(&self) -> Iter<'_, Vma> {
        self.vmas.iter()
    }

    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    /// Structural check of the underlying tree
    pub fn check(&self) -> Result<(), InvariantViolation> {
        self.vmas.check_invariants()
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Validate a page-aligned range inside the window; returns its last byte
    fn check_range(&self, addr: u64, size: u64) -> Result<u64, VmError> {
        if addr % PAGE_SIZE != 0 {
            return Err(VmError::Misaligned(addr));
        }
        match addr.checked_add(size) {
            Some(end) if addr >= self.mmap_base && end <= self.mmap_end => Ok(end - 1),
            _ => Err(VmError::InvalidRange),
        }
    }

    fn first_overlap(&self, addr: u64, last: u64) -> Option<(u64, u64)> {
        let id = self.vmas.find_above(addr)?;
        let (first, end) = self.vmas.range(id);
        (first <= last).then_some((first, end))
    }

    fn is_free(&self, addr: u64, size: u64) -> bool {
        match self.check_range(addr, size) {
            Ok(last) => self.first_overlap(addr, last).is_none(),
            Err(_) => false,
        }
    }

    /// Make `at` the start of a mapping if it lies inside one
    fn split_at(&mut self, at: u64) {
        let Some(id) = self.vmas.find(at) else {
            return;
        };
        let (first, last) = self.vmas.range(id);
        if first < at {
            let vma = *self.vmas.get(id);
            self.vmas.adjust(id, first, at - 1);
            self.vmas.insert(at, last, vma);
        }
    }
}

fn page_round(size: u64) -> Result<u64, VmError> {
    match align_up(size, PAGE_SIZE) {
        Some(0) | None => Err(VmError::InvalidRange),
        Some(size) => Ok(size),
    }
}
