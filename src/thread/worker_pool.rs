//! Elastic Worker Pool
//!
//! Workers pull jobs from one shared [`BlockingArrayQueue`]. The pool starts
//! `min` threads, adds one on dispatch when nobody is idle or the backlog
//! outgrows the idle workers (up to `max`), and lets a worker exit after it
//! has been idle for `max_idle` while more than `min` are alive.
//!
//! Thread accounting goes through one atomic `started` counter. Growth and
//! shrink both change it by compare-and-swap, so it never passes `max` and
//! shrinking never takes it below `min`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{BlockingArrayQueue, Interrupt, Job, SizedThreadPool, ThreadPool, WorkerContext};
use crate::error::{LifeCycleError, QueueError};
use crate::lifecycle::{dump_children, Dump, LifeCycle, State, StateCell};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Thread name prefix.
    pub name: String,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Idle time before a surplus worker exits. `None` never shrinks.
    pub max_idle: Option<Duration>,
    /// Grace period for workers to finish on stop.
    pub max_stop: Duration,
    /// Fixed queue size. `None` uses a growable queue.
    pub max_queued: Option<usize>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker-pool".to_string(),
            min_threads: 8,
            max_threads: 254,
            max_idle: Some(Duration::from_secs(60)),
            max_stop: Duration::from_millis(100),
            max_queued: None,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self) -> Result<(), LifeCycleError> {
        if self.max_threads == 0 {
            return Err(LifeCycleError::Config("max_threads must be at least 1".into()));
        }
        if self.min_threads > self.max_threads {
            return Err(LifeCycleError::Config(format!(
                "min_threads {} exceeds max_threads {}",
                self.min_threads, self.max_threads
            )));
        }
        Ok(())
    }
}

/// Per-thread bookkeeping visible to the pool.
struct WorkerSlot {
    name: String,
    interrupt: Interrupt,
    busy_since: Mutex<Option<Instant>>,
}

struct Shared {
    name: String,
    state: StateCell,
    queue: BlockingArrayQueue<Job>,
    min: AtomicUsize,
    max: AtomicUsize,
    max_idle: Option<Duration>,
    max_stop: Duration,
    started: AtomicUsize,
    idle: AtomicUsize,
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, Arc<WorkerSlot>>>,
}

enum Idle {
    Job(Job),
    Shrink,
    Exit,
}

impl Shared {
    #[inline]
    fn is_running(&self) -> bool {
        matches!(self.state.get(), State::Starting | State::Started)
    }

    /// Claims thread number `threads + 1` and spawns it. `false` if another
    /// caller claimed it first or the spawn failed.
    fn start_thread(self: &Arc<Self>, threads: usize) -> Result<bool, LifeCycleError> {
        if self
            .started
            .compare_exchange(threads, threads + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(WorkerSlot {
            name: format!("{}-{}", self.name, id),
            interrupt: Interrupt::new(),
            busy_since: Mutex::new(None),
        });
        self.workers.lock().insert(id, Arc::clone(&slot));

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(slot.name.clone())
            .spawn(move || shared.run_worker(id, slot));

        match spawned {
            Ok(_) => Ok(true),
            Err(e) => {
                self.started.fetch_sub(1, Ordering::AcqRel);
                self.workers.lock().remove(&id);
                Err(LifeCycleError::Spawn(e))
            }
        }
    }

    fn run_worker(self: Arc<Self>, id: u64, slot: Arc<WorkerSlot>) {
        debug!(worker = %slot.name, "worker started");
        let context = WorkerContext::new(slot.name.clone());
        let mut shrunk = false;
        let mut job = self.queue.poll();

        while self.is_running() {
            while let Some(j) = job.take() {
                if !self.is_running() {
                    break;
                }
                self.run_job(&slot, &context, j);
                job = self.queue.poll();
            }

            self.idle.fetch_add(1, Ordering::AcqRel);
            let outcome = self.idle_wait(&slot);
            self.idle.fetch_sub(1, Ordering::AcqRel);

            match outcome {
                Idle::Job(j) => job = Some(j),
                Idle::Shrink => {
                    shrunk = true;
                    break;
                }
                Idle::Exit => break,
            }
        }

        if !shrunk {
            self.started.fetch_sub(1, Ordering::AcqRel);
        }
        self.workers.lock().remove(&id);
        debug!(worker = %slot.name, shrunk, "worker exited");
    }

    fn idle_wait(&self, slot: &WorkerSlot) -> Idle {
        let idle_since = Instant::now();
        while self.is_running() {
            let Some(max_idle) = self.max_idle else {
                return match self.queue.take(&slot.interrupt) {
                    Ok(job) => Idle::Job(job),
                    Err(QueueError::Interrupted) | Err(QueueError::Full) => Idle::Exit,
                };
            };

            let started = self.started.load(Ordering::Acquire);
            if started > self.min.load(Ordering::Acquire) && idle_since.elapsed() >= max_idle {
                if self
                    .started
                    .compare_exchange(started, started - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Idle::Shrink;
                }
                continue;
            }

            match self.queue.poll_timeout(max_idle, &slot.interrupt) {
                Ok(Some(job)) => return Idle::Job(job),
                Ok(None) => {}
                Err(_) => return Idle::Exit,
            }
        }
        Idle::Exit
    }

    fn run_job(&self, slot: &WorkerSlot, context: &WorkerContext, job: Job) {
        *slot.busy_since.lock() = Some(Instant::now());
        if panic::catch_unwind(AssertUnwindSafe(|| job(context))).is_err() {
            warn!(worker = %slot.name, "job panicked");
        }
        *slot.busy_since.lock() = None;
    }

    /// Starts threads until `min` are alive.
    fn ensure_min(self: &Arc<Self>) -> Result<(), LifeCycleError> {
        loop {
            let threads = self.started.load(Ordering::Acquire);
            if threads >= self.min.load(Ordering::Acquire) {
                return Ok(());
            }
            self.start_thread(threads)?;
        }
    }
}

/// Elastic pool of named OS threads.
///
/// Dropping a running pool stops it.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Result<Self, LifeCycleError> {
        config.validate()?;
        let queue = match config.max_queued {
            Some(n) => BlockingArrayQueue::bounded(n),
            None => {
                let initial = config.min_threads.max(1);
                BlockingArrayQueue::with_capacity(initial, initial)
            }
        };
        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name,
                state: StateCell::new(),
                queue,
                min: AtomicUsize::new(config.min_threads),
                max: AtomicUsize::new(config.max_threads),
                max_idle: config.max_idle,
                max_stop: config.max_stop,
                started: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                workers: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    fn wait_for_exit(&self, start: Instant, budget: Duration) {
        while self.shared.started.load(Ordering::Acquire) > 0 && start.elapsed() < budget {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl ThreadPool for WorkerPool {
    fn dispatch(&self, job: Job) -> bool {
        let shared = &self.shared;
        if !shared.is_running() {
            return false;
        }

        let backlog = shared.queue.len();
        let idle = shared.idle.load(Ordering::Acquire);
        if shared.queue.offer(job).is_err() {
            return false;
        }

        if idle == 0 || backlog > idle {
            let threads = shared.started.load(Ordering::Acquire);
            if threads < shared.max.load(Ordering::Acquire) {
                if let Err(e) = shared.start_thread(threads) {
                    warn!(pool = %shared.name, error = %e, "could not start worker");
                }
            }
        }
        true
    }

    fn threads(&self) -> usize {
        self.shared.started.load(Ordering::Acquire)
    }

    fn idle_threads(&self) -> usize {
        self.shared.idle.load(Ordering::Acquire)
    }

    fn is_low_on_threads(&self) -> bool {
        self.threads() == self.max_threads() && self.queued() >= self.idle_threads()
    }
}

impl SizedThreadPool for WorkerPool {
    fn min_threads(&self) -> usize {
        self.shared.min.load(Ordering::Acquire)
    }

    fn max_threads(&self) -> usize {
        self.shared.max.load(Ordering::Acquire)
    }

    /// Raises `max` if needed and, when running, starts threads up to the new
    /// minimum.
    fn set_min_threads(&self, min: usize) {
        self.shared.min.store(min, Ordering::Release);
        if self.shared.max.load(Ordering::Acquire) < min {
            self.shared.max.store(min, Ordering::Release);
        }
        if self.shared.is_running() {
            if let Err(e) = self.shared.ensure_min() {
                warn!(pool = %self.shared.name, error = %e, "could not reach minimum threads");
            }
        }
    }

    /// Lowers `min` if needed. Running threads above the new maximum exit
    /// through the idle timeout.
    fn set_max_threads(&self, max: usize) {
        self.shared.max.store(max, Ordering::Release);
        if self.shared.min.load(Ordering::Acquire) > max {
            self.shared.min.store(max, Ordering::Release);
        }
    }
}

impl LifeCycle for WorkerPool {
    fn start(&self) -> Result<(), LifeCycleError> {
        self.shared.state.begin_start()?;
        match self.shared.ensure_min() {
            Ok(()) => {
                self.shared.state.set(State::Started);
                debug!(pool = %self.shared.name, threads = self.threads(), "worker pool started");
                Ok(())
            }
            Err(e) => {
                self.shared.state.set(State::Failed);
                Err(e)
            }
        }
    }

    fn stop(&self) -> Result<(), LifeCycleError> {
        if !self.shared.state.begin_stop()? {
            return Ok(());
        }
        let shared = &self.shared;
        let start = Instant::now();

        // let running jobs finish on their own for a while
        self.wait_for_exit(start, shared.max_stop / 2);

        // drop queued work and wake idle workers with no-op jobs
        shared.queue.clear();
        for _ in 0..shared.idle.load(Ordering::Acquire) {
            let _ = shared.queue.offer(Box::new(|_: &WorkerContext| {}));
        }
        thread::yield_now();

        if shared.started.load(Ordering::Acquire) > 0 {
            for slot in shared.workers.lock().values() {
                slot.interrupt.interrupt();
            }
            shared.queue.wake_all();
        }

        self.wait_for_exit(start, shared.max_stop);
        thread::yield_now();

        let stragglers = shared.workers.lock().len();
        if stragglers > 0 {
            warn!(pool = %shared.name, stragglers, "threads could not be stopped");
            info!("{}", self.dump());
        }
        shared.queue.clear();
        shared.state.set(State::Stopped);
        debug!(pool = %shared.name, "worker pool stopped");
        Ok(())
    }

    fn state(&self) -> State {
        self.shared.state.get()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

impl Dump for WorkerPool {
    fn dump_to(&self, out: &mut dyn fmt::Write, indent: &str) -> fmt::Result {
        writeln!(out, "{self}")?;
        let mut lines: Vec<String> = self
            .shared
            .workers
            .lock()
            .values()
            .map(|slot| match *slot.busy_since.lock() {
                Some(since) => format!("{} RUNNING {}ms", slot.name, since.elapsed().as_millis()),
                None => format!("{} IDLE", slot.name),
            })
            .collect();
        lines.sort();
        let children: Vec<&dyn Dump> = lines.iter().map(|l| l as &dyn Dump).collect();
        dump_children(out, indent, &children)
    }
}

impl fmt::Display for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkerPool{{{},{}<={}<={},i={},q={}}}",
            self.shared.name,
            self.min_threads(),
            self.threads(),
            self.max_threads(),
            self.idle_threads(),
            self.queued()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPoolConfig, Buffers};
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    fn config(min: usize, max: usize, idle_ms: u64) -> WorkerPoolConfig {
        WorkerPoolConfig {
            name: "test-pool".into(),
            min_threads: min,
            max_threads: max,
            max_idle: Some(Duration::from_millis(idle_ms)),
            max_stop: Duration::from_millis(500),
            max_queued: None,
        }
    }

    fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::new(config(2, 4, 1000)).unwrap();
        pool.start().unwrap();
        assert_eq!(pool.threads(), 2);

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            assert!(pool.dispatch(Box::new(move |_: &WorkerContext| tx.send(i).unwrap())));
        }
        let mut got: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        pool.stop().unwrap();
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn test_dispatch_refused_when_stopped() {
        let pool = WorkerPool::new(config(1, 1, 1000)).unwrap();
        assert!(!pool.dispatch(Box::new(|_: &WorkerContext| {})));
    }

    #[test]
    fn test_bounded_queue_rejects() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            max_queued: Some(1),
            ..config(1, 1, 1000)
        })
        .unwrap();
        pool.start().unwrap();

        let gate = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let g = Arc::clone(&gate);
        assert!(pool.dispatch(Box::new(move |_: &WorkerContext| {
            tx.send(()).unwrap();
            while !g.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        })));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(pool.dispatch(Box::new(|_: &WorkerContext| {})));
        assert!(!pool.dispatch(Box::new(|_: &WorkerContext| {})));
        assert!(pool.is_low_on_threads());

        gate.store(true, Ordering::Release);
        pool.stop().unwrap();
    }

    #[test]
    fn test_shrinks_to_min_never_below() {
        let pool = WorkerPool::new(config(2, 4, 100)).unwrap();
        pool.start().unwrap();

        let gate = Arc::new(AtomicBool::new(false));
        for _ in 0..8 {
            let g = Arc::clone(&gate);
            pool.dispatch(Box::new(move |_: &WorkerContext| {
                while !g.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            }));
        }
        assert!(wait_until(Duration::from_secs(2), || pool.threads() == 4));
        gate.store(true, Ordering::Release);

        let mut lowest = usize::MAX;
        let shrunk = wait_until(Duration::from_secs(3), || {
            lowest = lowest.min(pool.threads());
            pool.threads() == 2
        });
        assert!(shrunk, "{}", pool.dump());

        // stays at the floor well past another idle period
        for _ in 0..30 {
            lowest = lowest.min(pool.threads());
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(lowest, 2);
        assert_eq!(pool.threads(), 2);
        pool.stop().unwrap();
    }

    #[test]
    fn test_jobs_on_one_worker_share_buffer_cache() {
        let pool = WorkerPool::new(config(1, 1, 1000)).unwrap();
        pool.start().unwrap();
        let source = BufferPoolConfig::default().max_buffers(-1).build().unwrap();

        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let source = source.clone();
            let tx = tx.clone();
            assert!(pool.dispatch(Box::new(move |worker: &WorkerContext| {
                let cached = worker.cached_buffers();
                let buffers = source.checkout(worker);
                let header = buffers.get_header().unwrap();
                tx.send((header.id(), cached)).unwrap();
                buffers.return_buffer(header);
            })));
        }

        let (first, cached_before_first) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let (second, cached_before_second) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(cached_before_first, 0);
        assert_eq!(cached_before_second, 1);
        assert_eq!(first, second);
        pool.stop().unwrap();
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = WorkerPool::new(config(1, 1, 1000)).unwrap();
        pool.start().unwrap();
        pool.dispatch(Box::new(|_: &WorkerContext| panic!("boom")));

        let (tx, rx) = mpsc::channel();
        pool.dispatch(Box::new(move |_: &WorkerContext| tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pool.threads(), 1);
        pool.stop().unwrap();
    }

    #[test]
    fn test_set_min_starts_threads() {
        let pool = WorkerPool::new(config(1, 2, 1000)).unwrap();
        pool.start().unwrap();
        pool.set_min_threads(3);
        assert_eq!(pool.max_threads(), 3);
        assert_eq!(pool.threads(), 3);
        pool.set_max_threads(2);
        assert_eq!(pool.min_threads(), 2);
        pool.stop().unwrap();
    }

    #[test]
    fn test_stop_without_idle_timeout() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            max_idle: None,
            ..config(3, 3, 0)
        })
        .unwrap();
        pool.start().unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.idle_threads() == 3));
        pool.stop().unwrap();
        assert!(pool.is_stopped());
        assert_eq!(pool.threads(), 0);
    }

    #[test]
    fn test_dump_lists_workers() {
        let pool = WorkerPool::new(config(2, 2, 1000)).unwrap();
        pool.start().unwrap();
        assert!(wait_until(Duration::from_secs(1), || pool.idle_threads() == 2));
        let dump = pool.dump();
        assert!(dump.starts_with("WorkerPool{test-pool,2<=2<=2,i=2,q=0}"));
        assert_eq!(dump.matches(" IDLE").count(), 2);
        pool.stop().unwrap();
    }

    #[test]
    fn test_restart() {
        let pool = WorkerPool::new(config(1, 2, 1000)).unwrap();
        pool.start().unwrap();
        assert!(pool.start().is_err());
        pool.stop().unwrap();
        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        pool.dispatch(Box::new(move |_: &WorkerContext| tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        pool.stop().unwrap();
    }
}
