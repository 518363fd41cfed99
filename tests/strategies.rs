//! Proptest strategies for the VMA tree and its consumers
//!
//! Addresses are drawn from a small universe so that random operations
//! collide often and a brute-force oracle stays cheap.

use proptest::prelude::*;

/// Upper bound (exclusive) of generated tree addresses
pub const UNIVERSE: u64 = 2048;

/// Pages in the generated user mmap window
pub const WINDOW_PAGES: u64 = 64;

// ════════════════════════════════════════════════════════════
// VMA Tree Operations
// ════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum TreeOp {
    /// Insert `[first, first + len]` if that range is free
    Insert { first: u64, len: u64 },
    /// Remove the `pick`-th interval (modulo the count)
    Remove { pick: usize },
    /// Move the `pick`-th interval somewhere between its neighbours
    Adjust { pick: usize, lo: u64, hi: u64 },
}

pub fn tree_op() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        4 => (0..UNIVERSE, 0u64..64).prop_map(|(first, len)| TreeOp::Insert { first, len }),
        2 => any::<usize>().prop_map(|pick| TreeOp::Remove { pick }),
        1 => (any::<usize>(), any::<u64>(), any::<u64>())
            .prop_map(|(pick, lo, hi)| TreeOp::Adjust { pick, lo, hi }),
    ]
}

pub fn tree_ops() -> impl Strategy<Value = Vec<TreeOp>> {
    prop::collection::vec(tree_op(), 1..120)
}

/// Disjoint intervals, built by cutting the universe into runs
pub fn disjoint_ranges() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..40, 1u64..40), 0..40).prop_map(|runs| {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        for (gap, len) in runs {
            let first = cursor + gap;
            let last = first + len - 1;
            if last >= UNIVERSE {
                break;
            }
            out.push((first, last));
            cursor = last + 1;
        }
        out
    })
}

// ════════════════════════════════════════════════════════════
// Free-Range Requests
// ════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct FreeRequest {
    pub size: u64,
    pub align: u64,
    pub min: u64,
    pub max: u64,
}

pub fn alignment() -> impl Strategy<Value = u64> {
    prop_oneof![Just(0u64), Just(1), Just(2), Just(8), Just(16), Just(64), Just(256)]
}

pub fn free_request() -> impl Strategy<Value = FreeRequest> {
    (1u64..200, alignment(), 0..UNIVERSE, 0..UNIVERSE + 64)
        .prop_map(|(size, align, min, max)| FreeRequest { size, align, min, max })
}

// ════════════════════════════════════════════════════════════
// User Address-Space Operations
// ════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub enum MmOp {
    /// Fixed mapping of `pages` pages at page `page`
    Map { page: u64, pages: u64, prot: u32 },
    Unmap { page: u64, pages: u64 },
    Protect { page: u64, pages: u64, prot: u32 },
}

pub fn mm_op() -> impl Strategy<Value = MmOp> {
    let span = (0..WINDOW_PAGES, 1u64..12);
    prop_oneof![
        3 => (span.clone(), 1u32..8).prop_map(|((page, pages), prot)| MmOp::Map { page, pages, prot }),
        2 => span.clone().prop_map(|(page, pages)| MmOp::Unmap { page, pages }),
        1 => (span, 1u32..8).prop_map(|((page, pages), prot)| MmOp::Protect { page, pages, prot }),
    ]
}

pub fn mm_ops() -> impl Strategy<Value = Vec<MmOp>> {
    prop::collection::vec(mm_op(), 1..60)
}
