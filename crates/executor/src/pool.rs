//! Work-stealing worker pool.
//!
//! Each worker owns a deque guarded by its own mutex. Owners push and pop
//! at the bottom; thieves take from the top. Steal attempts use a timed
//! `try_lock` (1 ms) and move on to the next victim on contention, so a
//! busy owner never blocks a thief for long.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STEAL_LOCK_TIMEOUT: Duration = Duration::from_millis(1);
const IDLE_BACKOFF: Duration = Duration::from_micros(500);

enum Task {
    Run(Box<dyn FnOnce() -> usize + Send>),
    /// Sentinel: the receiving worker shuts down.
    Stop,
}

/// Counters kept by one worker.
#[derive(Debug, Default, Clone)]
pub struct WorkerMetrics {
    /// Tasks executed.
    pub tasks_processed: usize,
    /// Records reported by those tasks.
    pub records_processed: usize,
    /// Steal scans started after finding the local deque empty.
    pub steals_attempted: usize,
    /// Steal scans that yielded a task.
    pub steals_successful: usize,
    /// Victim locks that timed out.
    pub lock_contention_events: usize,
}

/// Aggregated counters for a finished pool run.
#[derive(Debug, Default, Clone)]
pub struct PoolMetrics {
    /// Per-worker counters, indexed by worker id.
    pub workers: Vec<WorkerMetrics>,
}

struct Shared {
    deques: Vec<Mutex<VecDeque<Task>>>,
    pending: AtomicUsize,
    done: Mutex<bool>,
    done_signal: Condvar,
    stopped: AtomicBool,
    metrics: Vec<Mutex<WorkerMetrics>>,
}

/// A pool of N workers with per-worker local deques.
pub struct WorkStealingPool {
    shared: Arc<Shared>,
    threads: Vec<std::thread::JoinHandle<()>>,
    next_seed: AtomicUsize,
}

impl WorkStealingPool {
    /// Create a pool; workers start immediately and idle until tasks arrive.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(Shared {
            deques: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
            pending: AtomicUsize::new(0),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
            stopped: AtomicBool::new(false),
            metrics: (0..workers).map(|_| Mutex::new(WorkerMetrics::default())).collect(),
        });
        let threads = (0..workers)
            .map(|wid| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("atomdb-scan-{}", wid))
                    .spawn(move || worker_loop(wid, shared))
                    .expect("spawn scan worker")
            })
            .collect();
        WorkStealingPool {
            shared,
            threads,
            next_seed: AtomicUsize::new(0),
        }
    }

    /// Number of workers.
    pub fn workers(&self) -> usize {
        self.shared.deques.len()
    }

    /// Submit a task, distributing seeds round-robin across workers.
    ///
    /// The task returns the number of records it processed, for metrics.
    pub fn submit(&self, task: impl FnOnce() -> usize + Send + 'static) {
        let wid = self.next_seed.fetch_add(1, Ordering::Relaxed) % self.workers();
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.shared.deques[wid].lock().push_back(Task::Run(Box::new(task)));
    }

    /// Block until every submitted task has finished.
    pub fn wait_idle(&self) {
        let mut done = self.shared.done.lock();
        while self.shared.pending.load(Ordering::SeqCst) != 0 {
            self.shared.done_signal.wait_for(&mut done, Duration::from_millis(10));
        }
    }

    /// Stop the workers and collect their metrics.
    pub fn shutdown(mut self) -> PoolMetrics {
        self.shared.stopped.store(true, Ordering::SeqCst);
        for deque in &self.shared.deques {
            deque.lock().push_back(Task::Stop);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let workers = self
            .shared
            .metrics
            .iter()
            .map(|m| m.lock().clone())
            .collect::<Vec<_>>();
        for (wid, m) in workers.iter().enumerate() {
            tracing::debug!(
                worker = wid,
                tasks = m.tasks_processed,
                records = m.records_processed,
                steals = m.steals_successful,
                contention = m.lock_contention_events,
                "scan worker finished"
            );
        }
        PoolMetrics { workers }
    }
}

fn worker_loop(wid: usize, shared: Arc<Shared>) {
    loop {
        let task = pop_local(&shared, wid).or_else(|| steal(&shared, wid));
        match task {
            Some(Task::Stop) => break,
            Some(Task::Run(run)) => {
                let records = run();
                {
                    let mut m = shared.metrics[wid].lock();
                    m.tasks_processed += 1;
                    m.records_processed += records;
                }
                if shared.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _done = shared.done.lock();
                    shared.done_signal.notify_all();
                }
            }
            None => {
                if shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }
}

/// Owners pop from the bottom of their own deque.
fn pop_local(shared: &Shared, wid: usize) -> Option<Task> {
    shared.deques[wid].lock().pop_back()
}

/// Thieves scan the other deques round-robin and take from the top.
fn steal(shared: &Shared, wid: usize) -> Option<Task> {
    let n = shared.deques.len();
    if n == 1 {
        return None;
    }
    {
        let mut m = shared.metrics[wid].lock();
        m.steals_attempted += 1;
    }
    let deadline = Instant::now() + STEAL_LOCK_TIMEOUT;
    for offset in 1..n {
        let victim = (wid + offset) % n;
        let guard = shared.deques[victim].try_lock_until(deadline);
        match guard {
            None => {
                let mut m = shared.metrics[wid].lock();
                m.lock_contention_events += 1;
            }
            Some(mut q) => {
                // Never steal a Stop sentinel: it addresses its owner.
                if matches!(q.front(), Some(Task::Run(_))) {
                    let task = q.pop_front();
                    drop(q);
                    let mut m = shared.metrics[wid].lock();
                    m.steals_successful += 1;
                    return task;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tasks_run() {
        let pool = WorkStealingPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                1
            });
        }
        pool.wait_idle();
        let metrics = pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        let total: usize = metrics.workers.iter().map(|m| m.tasks_processed).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_uneven_load_gets_stolen() {
        // One long-running seed plus many short tasks: with several workers
        // the short tasks must not all run on the seed's owner.
        let pool = WorkStealingPool::new(4);
        for i in 0..200 {
            pool.submit(move || {
                if i == 0 {
                    std::thread::sleep(Duration::from_millis(20));
                }
                1
            });
        }
        pool.wait_idle();
        let metrics = pool.shutdown();
        let busy_workers = metrics
            .workers
            .iter()
            .filter(|m| m.tasks_processed > 0)
            .count();
        assert!(busy_workers > 1, "work was not distributed");
    }

    #[test]
    fn test_shutdown_with_no_tasks() {
        let pool = WorkStealingPool::new(2);
        pool.wait_idle();
        let metrics = pool.shutdown();
        assert_eq!(metrics.workers.len(), 2);
    }
}
