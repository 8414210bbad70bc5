//! Cooperative cancellation for long-running queries.
//!
//! Executors check the token between chunks and at plan node boundaries. A
//! cancelled scan stops producing records without partial publication.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// Shared cancellation flag with an optional wall-clock deadline.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Token that never expires on its own.
    pub fn new() -> Self {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// Token that expires `timeout` from now.
    pub fn with_deadline(timeout: Duration) -> Self {
        CancellationToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match self.inner.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// Error out if cancelled; executors call this at chunk boundaries.
    pub fn check(&self) -> Result<()> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Err(Error::cancelled("query cancelled"));
        }
        if let Some(d) = self.inner.deadline {
            if Instant::now() >= d {
                return Err(Error::cancelled("query deadline exceeded"));
            }
        }
        Ok(())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        CancellationToken::new()
    }
}
