//! Unified error types for Kestrel using thiserror
//!
//! Only expected failures live here. Broken invariants (a mutex released by
//! a task that does not own it, a task reaped twice) are kernel panics.

use thiserror::Error;

use crate::types::{CpuId, TaskId};

/// Top-level error type for kernel services
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernError {
    #[error("task zone exhausted")]
    OutOfTasks,

    #[error("invalid cpu {0}")]
    InvalidCpu(CpuId),

    #[error("{0} is not online")]
    CpuOffline(CpuId),

    #[error("priority {0} outside the configured range")]
    InvalidPriority(u8),

    #[error("no such task: {0}")]
    NoSuchTask(TaskId),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("platform error: {0}")]
    Platform(&'static str),
}

/// Status of a blocking acquire that did not succeed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out")]
    TimedOut,

    #[error("interrupted by a pending signal")]
    Interrupted,

    #[error("would block")]
    WouldBlock,
}

/// Kernel configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cpu count {0} outside 1..={max}", max = crate::config::MAX_CPUS)]
    CpuCount(usize),

    #[error("priority level count {0} outside 1..={max}", max = crate::config::MAX_PRIORITY_LEVELS)]
    PriorityLevels(usize),

    #[error("timeslice must be non-zero")]
    ZeroTimeslice,

    #[error("task zone of {tasks} cannot hold {cpus} idle tasks")]
    TaskZoneTooSmall { tasks: usize, cpus: usize },
}

/// Address-space management errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("no free range large enough")]
    NoSpace,

    #[error("range {first:#x}..={last:#x} overlaps an existing mapping")]
    Overlap { first: u64, last: u64 },

    #[error("address {0:#x} is not mapped")]
    NotMapped(u64),

    #[error("invalid range")]
    InvalidRange,

    #[error("address {0:#x} is not page aligned")]
    Misaligned(u64),
}
