//! Chunk size and worker count heuristics.
//!
//! Tier thresholds are kept as is for compatibility purpose, they are not backed by any measurement.

use std::num::NonZeroUsize;

pub const KIB: u64 = 1_024;
pub const MIB: u64 = 1_024 * KIB;

/// Chunk size used when neither an explicit size nor adaptive sizing apply.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * MIB;

/// Worker cap used when the platform parallelism cannot be queried.
const FALLBACK_PARALLELISM: usize = 4;

/// Recommended chunk size and worker count for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStrategy {
    pub chunk_size: u64,
    pub worker_count: usize,
}

/// Number of workers available on this platform.
pub fn default_parallelism() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::new(FALLBACK_PARALLELISM).unwrap_or(NonZeroUsize::MIN))
}

#[inline]
fn cap(max_workers: Option<NonZeroUsize>) -> usize {
    max_workers.unwrap_or_else(default_parallelism).get()
}

/// Recommend a chunk size and a worker count for a file of `file_size` bytes.
///
/// The worker count never exceeds `max_workers`, defaulting to the platform parallelism.
///
/// ```
/// use std::num::NonZeroUsize;
///
/// use chunker::strategy::{recommend, MIB};
///
/// let strategy = recommend(50 * MIB, NonZeroUsize::new(8));
///
/// assert_eq!(strategy.chunk_size, 5 * MIB);
/// assert_eq!(strategy.worker_count, 4);
/// ```
pub fn recommend(file_size: u64, max_workers: Option<NonZeroUsize>) -> ChunkStrategy {
    let cap = cap(max_workers);

    let (chunk_size, worker_count) = match file_size {
        size if size < 10 * MIB => (MIB, cap.min(2)),
        size if size < 100 * MIB => (5 * MIB, cap.min(4)),
        size if size < 1_024 * MIB => (10 * MIB, cap.min(6)),
        _ => (20 * MIB, cap),
    };

    ChunkStrategy {
        chunk_size,
        worker_count,
    }
}

/// Number of workers to use for `chunk_count` chunks, never exceeding `max_workers`.
pub fn worker_count_for(chunk_count: u64, max_workers: Option<NonZeroUsize>) -> usize {
    let cap = cap(max_workers);

    match usize::try_from(chunk_count) {
        Ok(count) if count < cap => count.max(1),
        _ => cap,
    }
}

/// Number of chunks of `chunk_size` bytes needed to cover `file_size` bytes.
#[inline]
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size.max(1))
}
