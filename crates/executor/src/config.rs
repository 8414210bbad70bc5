//! Scan pool configuration with environment overrides.

use atomdb_core::env::{env_f64, env_usize};

/// Tuning knobs for the parallel scan pool.
///
/// Defaults favor small, predictable chunks; every field can be overridden
/// through `ATOMDB_PARALLEL_*` environment variables.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Number of workers (default: CPU count capped at 8).
    pub max_workers: usize,
    /// First chunk size tried by every worker.
    pub initial_chunk_size: usize,
    /// Lower clamp for adaptive chunk sizing.
    pub min_chunk_size: usize,
    /// Upper clamp for adaptive chunk sizing.
    pub max_chunk_size: usize,
    /// Below this chunk duration (ms) the controller grows the chunk.
    pub target_ms_low: f64,
    /// Above this chunk duration (ms) the controller shrinks the chunk.
    pub target_ms_high: f64,
    /// Smoothing factor of the duration EMA.
    pub ema_alpha: f64,
}

impl ParallelConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ParallelConfig {
            max_workers: env_usize("ATOMDB_PARALLEL_MAX_WORKERS", cores.min(8)).max(1),
            initial_chunk_size: env_usize("ATOMDB_PARALLEL_INITIAL_CHUNK", 1000).max(1),
            min_chunk_size: env_usize("ATOMDB_PARALLEL_MIN_CHUNK", 128).max(1),
            max_chunk_size: env_usize("ATOMDB_PARALLEL_MAX_CHUNK", 8192).max(1),
            target_ms_low: env_f64("ATOMDB_PARALLEL_TARGET_MS_LOW", 0.5),
            target_ms_high: env_f64("ATOMDB_PARALLEL_TARGET_MS_HIGH", 2.0),
            ema_alpha: env_f64("ATOMDB_PARALLEL_EMA_ALPHA", 0.2),
        }
    }

    /// Fixed small configuration for tests.
    pub fn for_testing(workers: usize) -> Self {
        ParallelConfig {
            max_workers: workers.max(1),
            initial_chunk_size: 8,
            min_chunk_size: 2,
            max_chunk_size: 64,
            target_ms_low: 0.5,
            target_ms_high: 2.0,
            ema_alpha: 0.2,
        }
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        ParallelConfig::from_env()
    }
}
