//! Bulk parallel iteration on one machine.
//!
//! [`Scheduler`] wraps a fixed-size rayon pool. Worker task handlers drive it
//! to process the index range they were assigned:
//!
//! ```rust
//! use lumen::parallel::{ParallelConfig, Scheduler};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! let scheduler = Scheduler::new(ParallelConfig::default().with_threads(2)).unwrap();
//! let sum = AtomicU64::new(0);
//! scheduler.run(0, 100, |index, _slot| {
//!     sum.fetch_add(index, Ordering::Relaxed);
//! });
//! assert_eq!(sum.into_inner(), 4950);
//! ```

use crate::component::Props;
use crate::dist::chunks;
use crate::error::{Error, Result};
use rayon::prelude::*;
use serde::Deserialize;

/// Type key of the rayon-backed scheduler.
pub const RAYON_SCHEDULER: &str = "parallel::rayon";

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Pool size. Zero uses rayon's default (one thread per core).
    pub num_threads: usize,
    /// Indices handed to a pool thread at a time.
    pub chunk_size: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            chunk_size: 64,
        }
    }
}

impl ParallelConfig {
    /// Read the config from props; `null` yields the defaults.
    pub fn from_props(props: &Props) -> Result<Self> {
        crate::dist::config::from_props(props)
    }

    /// Set the pool size.
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

/// Fixed-size thread pool for index-range work.
pub struct Scheduler {
    pool: rayon::ThreadPool,
    chunk_size: u64,
}

impl Scheduler {
    /// Build the pool.
    pub fn new(config: ParallelConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("lumen-parallel-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to build thread pool: {e}")))?;
        tracing::debug!(
            threads = pool.current_num_threads(),
            chunk_size = config.chunk_size,
            "parallel scheduler ready"
        );
        Ok(Self {
            pool,
            chunk_size: config.chunk_size.max(1),
        })
    }

    /// Create a scheduler by type key.
    pub fn create(key: &str, props: &Props) -> Result<Self> {
        if key != RAYON_SCHEDULER {
            return Err(Error::ComponentNotFound {
                key: key.to_string(),
            });
        }
        Self::new(ParallelConfig::from_props(props)?)
    }

    /// Number of threads in the pool. Thread slots are `0..num_threads()`.
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Invoke `f(index, thread_slot)` once for every index in `[start, end)`.
    ///
    /// Returns the number of indices processed.
    pub fn run<F>(&self, start: u64, end: u64, f: F) -> u64
    where
        F: Fn(u64, usize) + Sync + Send,
    {
        let blocks = chunks(start, end, self.chunk_size);
        self.pool.install(|| {
            blocks.par_iter().for_each(|block| {
                let slot = rayon::current_thread_index().unwrap_or(0);
                for index in block.range() {
                    f(index, slot);
                }
            });
        });
        end.saturating_sub(start)
    }

    /// Map every index in `[start, end)` and fold the results with `reduce`.
    pub fn map_reduce<T, M, R>(&self, start: u64, end: u64, identity: T, map: M, reduce: R) -> T
    where
        T: Clone + Send + Sync,
        M: Fn(u64) -> T + Sync + Send,
        R: Fn(T, T) -> T + Sync + Send,
    {
        let blocks = chunks(start, end, self.chunk_size);
        self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| {
                    block
                        .range()
                        .fold(identity.clone(), |acc, index| reduce(acc, map(index)))
                })
                .reduce(|| identity.clone(), &reduce)
        })
    }

    /// Apply `f(offset + i, &mut data[i], thread_slot)` to every element in parallel.
    pub fn for_each_mut<T, F>(&self, offset: u64, data: &mut [T], f: F)
    where
        T: Send,
        F: Fn(u64, &mut T, usize) + Sync + Send,
    {
        let chunk = usize::try_from(self.chunk_size).unwrap_or(usize::MAX);
        self.pool.install(|| {
            data.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(block, values)| {
                    let slot = rayon::current_thread_index().unwrap_or(0);
                    let base = offset + (block * chunk) as u64;
                    for (i, value) in values.iter_mut().enumerate() {
                        f(base + i as u64, value, slot);
                    }
                });
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_threads", &self.num_threads())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
