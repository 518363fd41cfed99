//! Kernel configuration
//!
//! Boot-time parameters for the concurrency core, validated once before any
//! per-CPU structure is allocated.

use static_assertions::const_assert;

use crate::error::ConfigError;

// ============================================================================
// Compile-time Limits
// ============================================================================

/// Maximum number of processors (one bit each in the online mask)
pub const MAX_CPUS: usize = 64;

/// Maximum number of priority levels (one bit each in the ready bitmap)
pub const MAX_PRIORITY_LEVELS: usize = 64;

/// Length of a timeslice when several tasks share a priority level
pub const DEFAULT_TIMESLICE_NS: u64 = 5_000_000;

/// Number of RCU generations that may have callbacks in flight
pub const RCU_GENERATION_RING: usize = 4;

/// Page size used by the address-space allocators
pub const PAGE_SIZE: u64 = 4096;

const_assert!(MAX_CPUS <= 64);
const_assert!(MAX_PRIORITY_LEVELS <= 64);
const_assert!(RCU_GENERATION_RING.is_power_of_two());
const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(DEFAULT_TIMESLICE_NS > 0);

// ============================================================================
// Kernel Configuration
// ============================================================================

/// Boot-time kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of processors that will be brought up
    pub nr_cpus: usize,
    /// Number of task priority levels; valid priorities are `0..priority_levels`
    pub priority_levels: usize,
    /// Round-robin timeslice in nanoseconds
    pub timeslice_ns: u64,
    /// Capacity of the task zone, idle tasks included
    pub max_tasks: usize,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            nr_cpus: 4,
            priority_levels: 32,
            timeslice_ns: DEFAULT_TIMESLICE_NS,
            max_tasks: 1024,
        }
    }

    pub const fn with_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub const fn with_priority_levels(mut self, levels: usize) -> Self {
        self.priority_levels = levels;
        self
    }

    pub const fn with_timeslice_ns(mut self, ns: u64) -> Self {
        self.timeslice_ns = ns;
        self
    }

    pub const fn with_max_tasks(mut self, tasks: usize) -> Self {
        self.max_tasks = tasks;
        self
    }

    /// Check every field against the compile-time limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(ConfigError::CpuCount(self.nr_cpus));
        }
        if self.priority_levels == 0 || self.priority_levels > MAX_PRIORITY_LEVELS {
            return Err(ConfigError::PriorityLevels(self.priority_levels));
        }
        if self.timeslice_ns == 0 {
            return Err(ConfigError::ZeroTimeslice);
        }
        if self.max_tasks < self.nr_cpus {
            return Err(ConfigError::TaskZoneTooSmall {
                tasks: self.max_tasks,
                cpus: self.nr_cpus,
            });
        }
        Ok(())
    }

    /// Highest valid task priority
    pub const fn max_priority(&self) -> u8 {
        (self.priority_levels - 1) as u8
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
