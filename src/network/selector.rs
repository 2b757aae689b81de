//! Selector sets
//!
//! Each set is one thread owning one `mio::Poll` and the endpoints
//! registered with it. Other threads talk to a set only through its change
//! queue and waker; registration and interest changes are applied by the
//! set's own thread.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{ConnectionFactory, EndPoint, SelectEndpoint};
use crate::error::LifeCycleError;
use crate::lifecycle::{dump_children, Dump, LifeCycle, State, StateCell};
use crate::thread::{Job, ThreadPool, WorkerContext};

pub(crate) const WAKE_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Number of selector sets, each with its own thread.
    pub select_sets: usize,
    /// Idle time before an endpoint expires. `None` disables expiry.
    pub max_idle: Option<Duration>,
    /// How often each set scans its endpoints for idleness.
    pub idle_check_period: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            select_sets: 1,
            max_idle: Some(Duration::from_secs(200)),
            idle_check_period: Duration::from_secs(1),
        }
    }
}

impl SelectorConfig {
    pub fn validate(&self) -> Result<(), LifeCycleError> {
        if self.select_sets == 0 {
            return Err(LifeCycleError::Config("select_sets must be at least 1".into()));
        }
        if self.idle_check_period.is_zero() {
            return Err(LifeCycleError::Config("idle_check_period must be positive".into()));
        }
        Ok(())
    }
}

/// Work for a set's own thread.
pub(crate) enum Change {
    Register(TcpStream),
    Update(Arc<SelectEndpoint>),
    Task(Job),
}

/// The part of a selector set other threads may touch.
pub(crate) struct SetShared {
    pub(crate) id: usize,
    pub(crate) changes: SegQueue<Change>,
    waker: Waker,
    running: AtomicBool,
    endpoints: AtomicUsize,
    pub(crate) pool: Arc<dyn ThreadPool>,
    factory: Arc<dyn ConnectionFactory>,
    pub(crate) max_idle: Option<Duration>,
}

impl SetShared {
    pub(crate) fn new(
        id: usize,
        waker: Waker,
        pool: Arc<dyn ThreadPool>,
        factory: Arc<dyn ConnectionFactory>,
        max_idle: Option<Duration>,
    ) -> Self {
        Self {
            id,
            changes: SegQueue::new(),
            waker,
            running: AtomicBool::new(true),
            endpoints: AtomicUsize::new(0),
            pool,
            factory,
            max_idle,
        }
    }

    /// Queues `change` and wakes the set.
    pub(crate) fn push(&self, change: Change) {
        self.changes.push(change);
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(set = self.id, error = %e, "selector wake failed");
        }
    }
}

/// State owned by a set's thread.
struct SelectLoop {
    shared: Arc<SetShared>,
    poll: Poll,
    events: Events,
    endpoints: HashMap<Token, Arc<SelectEndpoint>>,
    next_token: usize,
    idle_check_period: Duration,
    last_idle_check: Instant,
}

impl SelectLoop {
    fn run(mut self) {
        debug!(set = self.shared.id, "selector started");
        let worker = WorkerContext::new(format!("selector-{}", self.shared.id));

        while self.shared.running.load(Ordering::Acquire) {
            self.drain_changes(&worker);

            let timeout = self.idle_check_period.saturating_sub(self.last_idle_check.elapsed());
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(set = self.shared.id, error = %e, "poll failed");
                break;
            }

            for event in self.events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let Some(endpoint) = self.endpoints.get(&event.token()) else {
                    continue;
                };
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                endpoint.schedule(readable, writable);
            }

            let now = Instant::now();
            if now.duration_since(self.last_idle_check) >= self.idle_check_period {
                self.last_idle_check = now;
                for endpoint in self.endpoints.values() {
                    endpoint.check_idle(now);
                }
            }
        }

        self.close_all(&worker);
        debug!(set = self.shared.id, "selector stopped");
    }

    fn drain_changes(&mut self, worker: &WorkerContext) {
        while let Some(change) = self.shared.changes.pop() {
            match change {
                Change::Register(stream) => self.register(stream),
                Change::Update(endpoint) => {
                    if !endpoint.apply_update(self.poll.registry()) {
                        self.remove(endpoint.token());
                    }
                }
                Change::Task(job) => job(worker),
            }
        }
    }

    fn register(&mut self, stream: TcpStream) {
        let token = Token(self.next_token);
        self.next_token += 1;

        let endpoint = SelectEndpoint::new(stream, token, Arc::clone(&self.shared));
        let connection = self.shared.factory.new_connection(&endpoint);
        endpoint.set_connection(connection);

        if endpoint.apply_update(self.poll.registry()) {
            debug!(
                set = self.shared.id,
                token = token.0,
                remote = ?endpoint.remote_addr(),
                "endpoint registered"
            );
            self.endpoints.insert(token, endpoint);
            self.shared.endpoints.fetch_add(1, Ordering::AcqRel);
        } else {
            endpoint.notify_closed(false);
        }
    }

    fn remove(&mut self, token: Token) {
        if let Some(endpoint) = self.endpoints.remove(&token) {
            self.shared.endpoints.fetch_sub(1, Ordering::AcqRel);
            endpoint.notify_closed(false);
            trace!(set = self.shared.id, token = token.0, "endpoint removed");
        }
    }

    fn close_all(&mut self, worker: &WorkerContext) {
        for (_, endpoint) in self.endpoints.drain() {
            let _ = endpoint.close();
            endpoint.apply_update(self.poll.registry());
            endpoint.notify_closed(false);
        }
        self.shared.endpoints.store(0, Ordering::Release);

        // registrations that never made it onto the poller
        while let Some(change) = self.shared.changes.pop() {
            if let Change::Task(job) = change {
                job(worker);
            }
        }
    }
}

struct SetHandle {
    shared: Arc<SetShared>,
    thread: Option<JoinHandle<()>>,
}

/// Owns the selector sets and spreads new connections over them.
pub struct SelectorManager {
    config: SelectorConfig,
    pool: Arc<dyn ThreadPool>,
    factory: Arc<dyn ConnectionFactory>,
    state: StateCell,
    sets: Mutex<Vec<SetHandle>>,
    next_set: AtomicUsize,
}

impl SelectorManager {
    pub fn new(
        config: SelectorConfig,
        pool: Arc<dyn ThreadPool>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, LifeCycleError> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            factory,
            state: StateCell::new(),
            sets: Mutex::new(Vec::new()),
            next_set: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<dyn ThreadPool> {
        &self.pool
    }

    /// Hands an accepted, non-blocking stream to the next set.
    pub fn register(&self, stream: TcpStream) -> io::Result<()> {
        self.next(Change::Register(stream))
    }

    /// Runs `job` on one of the selector threads.
    pub fn add_task(&self, job: Job) -> io::Result<()> {
        self.next(Change::Task(job))
    }

    fn next(&self, change: Change) -> io::Result<()> {
        let sets = self.sets.lock();
        if sets.is_empty() || !self.is_running() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "selector manager is not running"));
        }
        let n = self.next_set.fetch_sub(1, Ordering::Relaxed);
        sets[n % sets.len()].shared.push(change);
        Ok(())
    }

    /// Endpoints currently registered across all sets.
    pub fn endpoints(&self) -> usize {
        self.sets
            .lock()
            .iter()
            .map(|s| s.shared.endpoints.load(Ordering::Acquire))
            .sum()
    }

    fn spawn_set(&self, id: usize) -> Result<SetHandle, LifeCycleError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(SetShared::new(
            id,
            waker,
            Arc::clone(&self.pool),
            Arc::clone(&self.factory),
            self.config.max_idle,
        ));

        let select_loop = SelectLoop {
            shared: Arc::clone(&shared),
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            endpoints: HashMap::new(),
            next_token: WAKE_TOKEN.0 + 1,
            idle_check_period: self.config.idle_check_period,
            last_idle_check: Instant::now(),
        };
        let thread = thread::Builder::new()
            .name(format!("selector-{id}"))
            .spawn(move || select_loop.run())
            .map_err(LifeCycleError::Spawn)?;

        Ok(SetHandle {
            shared,
            thread: Some(thread),
        })
    }

    fn shutdown_sets(&self) {
        let handles: Vec<SetHandle> = std::mem::take(&mut *self.sets.lock());
        for handle in &handles {
            handle.shared.running.store(false, Ordering::Release);
            handle.shared.wake();
        }
        for mut handle in handles {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    warn!(set = handle.shared.id, "selector thread panicked");
                }
            }
        }
    }
}

impl LifeCycle for SelectorManager {
    fn start(&self) -> Result<(), LifeCycleError> {
        self.state.begin_start()?;

        let mut handles = Vec::with_capacity(self.config.select_sets);
        for id in 0..self.config.select_sets {
            match self.spawn_set(id) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    *self.sets.lock() = handles;
                    self.shutdown_sets();
                    self.state.set(State::Failed);
                    return Err(e);
                }
            }
        }
        *self.sets.lock() = handles;

        self.state.set(State::Started);
        debug!(sets = self.config.select_sets, "selector manager started");
        Ok(())
    }

    fn stop(&self) -> Result<(), LifeCycleError> {
        if !self.state.begin_stop()? {
            return Ok(());
        }
        self.shutdown_sets();
        self.state.set(State::Stopped);
        debug!("selector manager stopped");
        Ok(())
    }

    fn state(&self) -> State {
        self.state.get()
    }
}

impl Drop for SelectorManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct SetSummary {
    id: usize,
    endpoints: usize,
    changes: usize,
}

impl Dump for SetSummary {
    fn dump_to(&self, out: &mut dyn fmt::Write, _indent: &str) -> fmt::Result {
        writeln!(
            out,
            "SelectSet{{{},endpoints={},changes={}}}",
            self.id, self.endpoints, self.changes
        )
    }
}

impl Dump for SelectorManager {
    fn dump_to(&self, out: &mut dyn fmt::Write, indent: &str) -> fmt::Result {
        writeln!(out, "{self}")?;
        let sets: Vec<SetSummary> = self
            .sets
            .lock()
            .iter()
            .map(|s| SetSummary {
                id: s.shared.id,
                endpoints: s.shared.endpoints.load(Ordering::Acquire),
                changes: s.shared.changes.len(),
            })
            .collect();
        let children: Vec<&dyn Dump> = sets.iter().map(|s| s as &dyn Dump).collect();
        dump_children(out, indent, &children)
    }
}

impl fmt::Display for SelectorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SelectorManager{{{},sets={},endpoints={}}}",
            self.state.get(),
            self.config.select_sets,
            self.endpoints()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Connection, Handled};
    use crate::thread::{WorkerPool, WorkerPoolConfig};
    use std::sync::mpsc;

    struct Idle;

    impl Connection for Idle {
        fn handle(&mut self, _endpoint: &Arc<SelectEndpoint>, _worker: &WorkerContext) -> io::Result<Handled> {
            Ok(Handled::Continue)
        }
    }

    fn manager(sets: usize) -> (SelectorManager, Arc<WorkerPool>) {
        let pool = Arc::new(
            WorkerPool::new(WorkerPoolConfig {
                min_threads: 2,
                max_threads: 4,
                ..Default::default()
            })
            .unwrap(),
        );
        pool.start().unwrap();
        let factory: Arc<dyn ConnectionFactory> =
            Arc::new(|_: &Arc<SelectEndpoint>| -> Box<dyn Connection> { Box::new(Idle) });
        let config = SelectorConfig {
            select_sets: sets,
            ..Default::default()
        };
        let manager = SelectorManager::new(config, pool.clone(), factory).unwrap();
        (manager, pool)
    }

    #[test]
    fn test_rejects_zero_sets() {
        let config = SelectorConfig {
            select_sets: 0,
            ..Default::default()
        };
        let pool: Arc<dyn ThreadPool> = Arc::new(WorkerPool::new(WorkerPoolConfig::default()).unwrap());
        let factory: Arc<dyn ConnectionFactory> =
            Arc::new(|_: &Arc<SelectEndpoint>| -> Box<dyn Connection> { Box::new(Idle) });
        assert!(SelectorManager::new(config, pool, factory).is_err());
    }

    #[test]
    fn test_register_before_start_fails() {
        let (manager, _pool) = manager(1);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        let err = manager.register(TcpStream::from_std(stream)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_tasks_run_on_selector_threads() {
        let (manager, _pool) = manager(2);
        manager.start().unwrap();

        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            manager
                .add_task(Box::new(move |worker: &WorkerContext| {
                    let name = thread::current().name().map(str::to_string);
                    assert_eq!(name.as_deref(), Some(worker.name()));
                    let _ = tx.send(name);
                }))
                .unwrap();
        }

        let mut names: Vec<String> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names, vec!["selector-0".to_string(), "selector-1".to_string()]);

        manager.stop().unwrap();
        assert!(manager.is_stopped());
    }

    #[test]
    fn test_register_counts_endpoints_and_dumps() {
        let (manager, _pool) = manager(1);
        manager.start().unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        manager.register(TcpStream::from_std(server)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while manager.endpoints() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.endpoints(), 1);

        let dump = manager.dump();
        assert!(dump.starts_with("SelectorManager{STARTED,sets=1,endpoints=1}"));
        assert!(dump.contains(" +- SelectSet{0,endpoints=1,changes=0}"));

        manager.stop().unwrap();
        assert_eq!(manager.endpoints(), 0);
    }
}
