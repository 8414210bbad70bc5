//! The `parallel_scan` helper used by full-scan query paths.

use crate::chunk::ChunkController;
use crate::config::ParallelConfig;
use crate::pool::WorkStealingPool;
use atomdb_core::{CancellationToken, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Scan a logical array of `data_len` items with a worker pool.
///
/// `fetch(offset, count)` returns up to `count` items starting at
/// `offset`; `process` maps an item to an output or drops it with `None`.
/// Results carry no ordering guarantee. Each seed range is consumed in
/// adaptively sized chunks so chunk latency stays inside the configured
/// band; the cancellation token is checked between chunks, and a cancelled
/// scan returns the cancellation error without partial results.
///
/// With a single worker the scan degrades to plain sequential chunking.
pub fn parallel_scan<T, R, F, P>(
    data_len: usize,
    fetch: F,
    process: P,
    config: &ParallelConfig,
    token: &CancellationToken,
) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(usize, usize) -> Vec<T> + Send + Sync + 'static,
    P: Fn(T) -> Option<R> + Send + Sync + 'static,
{
    if data_len == 0 {
        return Ok(Vec::new());
    }
    if config.max_workers <= 1 {
        return sequential_scan(data_len, &fetch, &process, config, token);
    }

    let fetch = Arc::new(fetch);
    let process = Arc::new(process);
    let results = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkStealingPool::new(config.max_workers);

    // Coarse seed ranges (4x the initial chunk) reduce submission overhead;
    // workers re-chunk adaptively inside their range.
    let seed = (config.initial_chunk_size * 4)
        .clamp(config.min_chunk_size, config.max_chunk_size.max(1));
    let mut start = 0usize;
    while start < data_len {
        let count = seed.min(data_len - start);
        let fetch = fetch.clone();
        let process = process.clone();
        let results = results.clone();
        let token = token.clone();
        let config = config.clone();
        pool.submit(move || {
            let mut controller = ChunkController::new(&config);
            let mut local_start = start;
            let local_end = start + count;
            let mut processed = 0usize;
            while local_start < local_end {
                if token.is_cancelled() {
                    return processed;
                }
                let want = controller.next_size().min(local_end - local_start);
                let began = Instant::now();
                let fetched = fetch(local_start, want);
                if fetched.is_empty() {
                    break;
                }
                let got = fetched.len();
                let mut out: Vec<R> = fetched.into_iter().filter_map(&*process).collect();
                controller.on_chunk_timing(began.elapsed().as_secs_f64() * 1000.0);
                results.lock().append(&mut out);
                processed += got;
                local_start += got;
            }
            processed
        });
        start += count;
    }

    pool.wait_idle();
    pool.shutdown();
    token.check()?;
    Ok(match Arc::try_unwrap(results) {
        Ok(m) => m.into_inner(),
        Err(shared) => {
            let mut guard = shared.lock();
            std::mem::take(&mut *guard)
        }
    })
}

fn sequential_scan<T, R>(
    data_len: usize,
    fetch: &dyn Fn(usize, usize) -> Vec<T>,
    process: &dyn Fn(T) -> Option<R>,
    config: &ParallelConfig,
    token: &CancellationToken,
) -> Result<Vec<R>> {
    let mut out = Vec::new();
    let mut controller = ChunkController::new(config);
    let mut offset = 0usize;
    while offset < data_len {
        token.check()?;
        let want = controller.next_size().min(data_len - offset);
        let began = Instant::now();
        let fetched = fetch(offset, want);
        if fetched.is_empty() {
            break;
        }
        let got = fetched.len();
        out.extend(fetched.into_iter().filter_map(process));
        controller.on_chunk_timing(began.elapsed().as_secs_f64() * 1000.0);
        offset += got;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(len: usize) -> impl Fn(usize, usize) -> Vec<i64> + Send + Sync + 'static {
        move |offset, count| {
            (offset..(offset + count).min(len)).map(|i| i as i64).collect()
        }
    }

    #[test]
    fn test_scan_visits_everything_once() {
        let cfg = ParallelConfig::for_testing(4);
        let mut out = parallel_scan(
            1000,
            source(1000),
            |v| (v % 2 == 0).then_some(v),
            &cfg,
            &CancellationToken::new(),
        )
        .unwrap();
        out.sort();
        let expected: Vec<i64> = (0..1000).filter(|v| v % 2 == 0).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_single_worker_is_sequential() {
        let cfg = ParallelConfig::for_testing(1);
        let out = parallel_scan(
            100,
            source(100),
            Some,
            &cfg,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(out.len(), 100);
        // Sequential fallback preserves order.
        assert!(out.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_empty_input() {
        let cfg = ParallelConfig::for_testing(2);
        let out =
            parallel_scan(0, source(0), Some, &cfg, &CancellationToken::new()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_cancelled_scan_errors() {
        let cfg = ParallelConfig::for_testing(2);
        let token = CancellationToken::new();
        token.cancel();
        let err = parallel_scan(1000, source(1000), Some, &cfg, &token).unwrap_err();
        assert!(err.is_cancelled());
    }
}
