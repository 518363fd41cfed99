//! Kestrel - the concurrency core of a small SMP kernel
//!
//! This crate provides the per-CPU scheduler, deferred procedure calls,
//! per-CPU timers, segment-tree RCU, the sleeping mutex and semaphore, and
//! the VMA interval tree with the address-space managers built on it.
//!
//! Everything hardware specific sits behind [`platform::Platform`]; the
//! crate itself is `no_std` + `alloc`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in address arithmetic
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

pub mod console;
pub mod kern;
pub mod kernel;
pub mod platform;
pub mod vm;

pub use config::KernelConfig;
pub use error::{ConfigError, KernError, LockError, VmError};
pub use kernel::Kernel;
pub use platform::Platform;
pub use types::{CpuId, Priority, TaskId, Ticket};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Kestrel";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Kestrel");
        assert!(!VERSION.is_empty());
    }
}
