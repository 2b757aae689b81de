//! Worker Threads
//!
//! - [`BlockingArrayQueue`]: two-lock growable FIFO the workers pull from
//! - [`WorkerPool`]: elastic pool of OS threads bounded by `[min, max]`
//! - [`ThreadPool`]: the dispatch seam the reactor depends on
//! - [`WorkerContext`]: per-worker state every job is handed

mod context;
mod queue;
mod worker_pool;

use std::sync::Arc;

pub use context::WorkerContext;
pub use queue::{BlockingArrayQueue, Interrupt, DEFAULT_CAPACITY, DEFAULT_GROWTH};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

/// Unit of work run on a pool thread, given that thread's context.
pub type Job = Box<dyn FnOnce(&WorkerContext) + Send + 'static>;

pub trait ThreadPool: Send + Sync {
    /// Queues `job`. `false` when the pool is not running or its queue is
    /// full; the job is then dropped unrun.
    fn dispatch(&self, job: Job) -> bool;

    /// Live worker threads.
    fn threads(&self) -> usize;

    /// Workers waiting for a job.
    fn idle_threads(&self) -> usize;

    /// At the thread ceiling with at least as many queued jobs as idle
    /// workers.
    fn is_low_on_threads(&self) -> bool;
}

pub trait SizedThreadPool: ThreadPool {
    fn min_threads(&self) -> usize;
    fn max_threads(&self) -> usize;
    fn set_min_threads(&self, min: usize);
    fn set_max_threads(&self, max: usize);
}

impl<T: ThreadPool + ?Sized> ThreadPool for Arc<T> {
    fn dispatch(&self, job: Job) -> bool {
        (**self).dispatch(job)
    }

    fn threads(&self) -> usize {
        (**self).threads()
    }

    fn idle_threads(&self) -> usize {
        (**self).idle_threads()
    }

    fn is_low_on_threads(&self) -> bool {
        (**self).is_low_on_threads()
    }
}
