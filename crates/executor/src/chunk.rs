//! Per-worker adaptive chunk sizing.

use crate::config::ParallelConfig;

/// Keeps chunk durations inside a target latency band.
///
/// The controller tracks an exponential moving average of observed chunk
/// durations and multiplies the next chunk size by 1.5 when chunks finish
/// under the low target, or divides by 1.5 when they overshoot the high
/// target, clamped to the configured bounds.
#[derive(Debug)]
pub struct ChunkController {
    min: usize,
    max: usize,
    low_ms: f64,
    high_ms: f64,
    alpha: f64,
    size: usize,
    ema_ms: Option<f64>,
}

impl ChunkController {
    /// A controller starting at the configured initial chunk size.
    pub fn new(cfg: &ParallelConfig) -> Self {
        ChunkController {
            min: cfg.min_chunk_size,
            max: cfg.max_chunk_size,
            low_ms: cfg.target_ms_low,
            high_ms: cfg.target_ms_high,
            alpha: cfg.ema_alpha,
            size: cfg.initial_chunk_size,
            ema_ms: None,
        }
    }

    /// Chunk size to use for the next fetch.
    pub fn next_size(&self) -> usize {
        self.size.clamp(self.min, self.max)
    }

    /// Feed back the duration of the chunk that just completed.
    pub fn on_chunk_timing(&mut self, elapsed_ms: f64) {
        let ema = match self.ema_ms {
            None => elapsed_ms,
            Some(prev) => self.alpha * elapsed_ms + (1.0 - self.alpha) * prev,
        };
        self.ema_ms = Some(ema);
        let mut next = self.size;
        if ema < self.low_ms {
            next = ((self.size as f64) * 1.5) as usize;
        } else if ema > self.high_ms {
            next = (((self.size as f64) / 1.5) as usize).max(1);
        }
        self.size = next.clamp(self.min, self.max);
    }

    /// The smoothed duration, if any chunk has completed yet.
    pub fn ema_ms(&self) -> Option<f64> {
        self.ema_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ParallelConfig {
        ParallelConfig {
            max_workers: 1,
            initial_chunk_size: 100,
            min_chunk_size: 10,
            max_chunk_size: 1000,
            target_ms_low: 0.5,
            target_ms_high: 2.0,
            ema_alpha: 0.2,
        }
    }

    #[test]
    fn test_fast_chunks_grow() {
        let mut c = ChunkController::new(&cfg());
        c.on_chunk_timing(0.1);
        assert_eq!(c.next_size(), 150);
    }

    #[test]
    fn test_slow_chunks_shrink() {
        let mut c = ChunkController::new(&cfg());
        c.on_chunk_timing(10.0);
        assert_eq!(c.next_size(), 66);
    }

    #[test]
    fn test_in_band_is_stable() {
        let mut c = ChunkController::new(&cfg());
        c.on_chunk_timing(1.0);
        assert_eq!(c.next_size(), 100);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let mut c = ChunkController::new(&cfg());
        for _ in 0..50 {
            c.on_chunk_timing(0.01);
        }
        assert_eq!(c.next_size(), 1000);
        for _ in 0..50 {
            c.on_chunk_timing(100.0);
        }
        assert_eq!(c.next_size(), 10);
    }

    #[test]
    fn test_ema_smooths_spikes() {
        let mut c = ChunkController::new(&cfg());
        for _ in 0..10 {
            c.on_chunk_timing(1.0);
        }
        // One spike does not immediately push the EMA over the high target.
        c.on_chunk_timing(4.0);
        assert!(c.ema_ms().unwrap() < 2.0);
        assert_eq!(c.next_size(), 100);
    }
}
