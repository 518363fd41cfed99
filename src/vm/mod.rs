//! Virtual memory bookkeeping
//!
//! The interval tree and the two address-space managers built on it: the
//! kernel vmap window and per-process user layouts.

pub mod mmap;
pub mod vma_tree;
pub mod vmap;

pub use mmap::{AddressSpace, Vma, VmaProt};
pub use vma_tree::{InvariantViolation, VmaEntry, VmaId, VmaTree, VMA_TREE_MAX};
pub use vmap::{VmapArea, VmapKind, VmapSpace};
