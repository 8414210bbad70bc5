//! Parallel scanning: adaptive chunking and a work-stealing pool
//!
//! Used by full-scan query paths. Each worker owns a local deque of tasks;
//! it pops from the bottom of its own deque and, when empty, steals from
//! the top of a victim's. A per-worker controller keeps chunk durations
//! inside a target latency band by growing or shrinking the next chunk
//! size around an exponential moving average.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod config;
pub mod pool;
pub mod scan;

pub use chunk::ChunkController;
pub use config::ParallelConfig;
pub use pool::{PoolMetrics, WorkStealingPool, WorkerMetrics};
pub use scan::parallel_scan;
