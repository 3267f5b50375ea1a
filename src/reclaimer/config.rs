//! Pool configuration.

use crate::backoff::Backoff;
use crate::error::ConfigError;

/// Everything fixed at construction time.
///
/// ```
/// use reclaimer::{Backoff, PoolConfig};
///
/// let config = PoolConfig::default()
///     .with_capacity(16)
///     .with_threads(4)
///     .with_backoff(Backoff::Spin);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of object slots in the pool.
    pub capacity: usize,
    /// Number of worker threads, T. The countdown each cycle waits on starts at
    /// T - 1.
    pub threads: usize,
    /// How many full passes over the pool `allocate` makes before it gives up
    /// with `PoolExhausted`.
    pub alloc_sweeps: usize,
    /// What to do at every spin point.
    pub backoff: Backoff,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            capacity: 64,
            threads: 1,
            alloc_sweeps: 2,
            backoff: Backoff::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(mut self, capacity: usize) -> PoolConfig {
        self.capacity = capacity;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> PoolConfig {
        self.threads = threads;
        self
    }

    pub fn with_alloc_sweeps(mut self, alloc_sweeps: usize) -> PoolConfig {
        self.alloc_sweeps = alloc_sweeps;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> PoolConfig {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::EmptyPool);
        }
        // handles are u32 indices, and u32::MAX is the queue's null link
        if self.capacity >= u32::MAX as usize {
            return Err(ConfigError::PoolTooLarge(self.capacity));
        }
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.alloc_sweeps == 0 {
            return Err(ConfigError::NoSweeps);
        }
        Ok(())
    }
}
