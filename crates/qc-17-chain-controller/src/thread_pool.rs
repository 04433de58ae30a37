//! Named worker pool for work that never touches the state store: merkle
//! roots, block serialization and signature recovery.

use crate::error::{ChainError, ChainResult};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;
use tracing::debug;

/// Handle to a result computed on the pool.
#[derive(Debug)]
#[must_use = "the result is lost unless awaited with get()"]
pub struct AsyncResult<T> {
    receiver: oneshot::Receiver<ChainResult<T>>,
}

impl<T> AsyncResult<T> {
    /// Block until the task finishes.
    pub fn get(self) -> ChainResult<T> {
        self.receiver
            .blocking_recv()
            .map_err(|_| ChainError::Internal("thread pool task was dropped before completing".into()))?
    }
}

#[derive(Debug)]
pub struct NamedThreadPool {
    pool: ThreadPool,
    size: usize,
}

impl NamedThreadPool {
    /// Pool of `size` threads named `{prefix}-{i}`.
    pub fn new(prefix: &'static str, size: usize) -> ChainResult<Self> {
        if size == 0 {
            return Err(ChainError::InvalidConfig("thread pool size must be greater than 0".into()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| ChainError::Internal(format!("failed to start {prefix} thread pool: {e}")))?;
        debug!(prefix, size, "[qc-17] thread pool started");
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on the pool; await the outcome with [`AsyncResult::get`].
    pub fn post<T, F>(&self, f: F) -> AsyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ChainResult<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = sender.send(f());
        });
        AsyncResult { receiver }
    }

    /// Fire and forget, e.g. dropping a large branch off the write thread.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_returns_value_from_named_thread() {
        let pool = NamedThreadPool::new("chain", 2).unwrap();
        let name = pool
            .post(|| Ok(std::thread::current().name().map(str::to_owned)))
            .get()
            .unwrap();
        assert!(name.unwrap().starts_with("chain-"));
    }

    #[test]
    fn test_post_propagates_errors() {
        let pool = NamedThreadPool::new("chain", 1).unwrap();
        let result: ChainResult<()> = pool.post(|| Err(ChainError::Internal("boom".into()))).get();
        assert!(matches!(result, Err(ChainError::Internal(_))));
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(NamedThreadPool::new("chain", 0).is_err());
    }
}
