//! Synchronous future returned by storage operations.
//!
//! Storage calls return a uniform `Future<T>` with `get()`. The current
//! implementations complete eagerly, but callers only rely on `get()`, so
//! a provider is free to defer the work.

use crate::error::Result;

/// Result of an asynchronous-looking storage operation.
pub struct Future<T> {
    state: State<T>,
}

enum State<T> {
    Ready(Result<T>),
    Deferred(Box<dyn FnOnce() -> Result<T> + Send>),
}

impl<T> Future<T> {
    /// A future that already completed successfully.
    pub fn ready(value: T) -> Self {
        Future {
            state: State::Ready(Ok(value)),
        }
    }

    /// A future that already failed.
    pub fn failed(err: crate::Error) -> Self {
        Future {
            state: State::Ready(Err(err)),
        }
    }

    /// Wrap an already computed result.
    pub fn from_result(result: Result<T>) -> Self {
        Future {
            state: State::Ready(result),
        }
    }

    /// A future that runs `f` when first awaited.
    pub fn lazy(f: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        Future {
            state: State::Deferred(Box::new(f)),
        }
    }

    /// Wait for the result, consuming the future.
    pub fn get(self) -> Result<T> {
        match self.state {
            State::Ready(r) => r,
            State::Deferred(f) => f(),
        }
    }

    /// Transform the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U + Send + 'static) -> Future<U>
    where
        T: 'static,
    {
        match self.state {
            State::Ready(r) => Future::from_result(r.map(f)),
            State::Deferred(inner) => Future {
                state: State::Deferred(Box::new(move || inner().map(f))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_ready_and_failed() {
        assert_eq!(Future::ready(7).get().unwrap(), 7);
        assert!(Future::<i32>::failed(Error::validation("nope")).get().is_err());
    }

    #[test]
    fn test_lazy_runs_on_get() {
        let fut = Future::lazy(|| Ok(21 * 2));
        assert_eq!(fut.get().unwrap(), 42);
    }

    #[test]
    fn test_map_chains() {
        let fut = Future::ready(10).map(|v| v + 1);
        assert_eq!(fut.get().unwrap(), 11);
    }
}
