//! Blocking acceptors feeding the selector sets

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream as StdStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ConnectionFactory, SelectorConfig, SelectorManager, SocketOptions};
use crate::error::LifeCycleError;
use crate::lifecycle::{dump_children, Dump, LifeCycle, State, StateCell};
use crate::thread::ThreadPool;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub addr: SocketAddr,
    /// Threads blocked in `accept`.
    pub acceptors: usize,
    pub selector: SelectorConfig,
    pub socket: SocketOptions,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            acceptors: 1,
            selector: SelectorConfig::default(),
            socket: SocketOptions::default(),
        }
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<(), LifeCycleError> {
        if self.acceptors == 0 {
            return Err(LifeCycleError::Config("acceptors must be at least 1".into()));
        }
        self.selector.validate()
    }
}

struct Acceptor {
    listener: TcpListener,
    running: AtomicBool,
    manager: Arc<SelectorManager>,
    socket: SocketOptions,
    accepted: AtomicU64,
}

impl Acceptor {
    fn run(&self, id: usize) {
        debug!(acceptor = id, "acceptor started");
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = self.accept(stream) {
                        debug!(acceptor = id, %peer, error = %e, "dropped accepted connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    warn!(acceptor = id, error = %e, "accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
        debug!(acceptor = id, "acceptor stopped");
    }

    fn accept(&self, stream: StdStream) -> io::Result<()> {
        self.socket.apply(&stream)?;
        self.manager.register(TcpStream::from_std(stream))?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A listening socket, its acceptor threads and the selector sets they feed.
pub struct SelectConnector {
    config: ConnectorConfig,
    manager: Arc<SelectorManager>,
    state: StateCell,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SelectConnector {
    pub fn new(
        config: ConnectorConfig,
        pool: Arc<dyn ThreadPool>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, LifeCycleError> {
        config.validate()?;
        let manager = SelectorManager::new(config.selector, pool, factory)?;
        Ok(Self {
            config,
            manager: Arc::new(manager),
            state: StateCell::new(),
            acceptor: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SelectorManager> {
        &self.manager
    }

    /// Bound address while running. Differs from the configured one when
    /// port 0 was requested.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().as_ref().and_then(|a| a.listener.local_addr().ok())
    }

    /// Connections handed to the selector sets so far.
    pub fn accepted(&self) -> u64 {
        self.acceptor
            .lock()
            .as_ref()
            .map_or(0, |a| a.accepted.load(Ordering::Relaxed))
    }

    fn open(&self) -> Result<(), LifeCycleError> {
        self.manager.start()?;

        let listener = TcpListener::bind(self.config.addr)?;
        let acceptor = Arc::new(Acceptor {
            listener,
            running: AtomicBool::new(true),
            manager: Arc::clone(&self.manager),
            socket: self.config.socket,
            accepted: AtomicU64::new(0),
        });
        *self.acceptor.lock() = Some(Arc::clone(&acceptor));

        let mut threads = self.threads.lock();
        for id in 0..self.config.acceptors {
            let acceptor = Arc::clone(&acceptor);
            let thread = thread::Builder::new()
                .name(format!("acceptor-{id}"))
                .spawn(move || acceptor.run(id))
                .map_err(LifeCycleError::Spawn)?;
            threads.push(thread);
        }
        Ok(())
    }

    /// Stops the acceptors: clear the flag, then connect once per thread so
    /// every blocked `accept` returns.
    fn close(&self) {
        let Some(acceptor) = self.acceptor.lock().take() else {
            return;
        };
        acceptor.running.store(false, Ordering::Release);

        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        if let Ok(addr) = acceptor.listener.local_addr() {
            let target = unblock_target(addr);
            for _ in 0..threads.len() {
                let _ = StdStream::connect_timeout(&target, Duration::from_millis(100));
            }
        }
        for thread in threads {
            if thread.join().is_err() {
                warn!("acceptor thread panicked");
            }
        }
    }
}

/// Where to connect to reach a listener bound to `addr`.
fn unblock_target(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}

impl LifeCycle for SelectConnector {
    fn start(&self) -> Result<(), LifeCycleError> {
        self.state.begin_start()?;
        if let Err(e) = self.open() {
            self.close();
            let _ = self.manager.stop();
            self.state.set(State::Failed);
            return Err(e);
        }
        self.state.set(State::Started);
        info!(
            addr = ?self.local_addr(),
            acceptors = self.config.acceptors,
            "connector started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<(), LifeCycleError> {
        if !self.state.begin_stop()? {
            return Ok(());
        }
        self.close();
        let result = self.manager.stop();
        self.state.set(State::Stopped);
        info!("connector stopped");
        result
    }

    fn state(&self) -> State {
        self.state.get()
    }
}

impl Drop for SelectConnector {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl Dump for SelectConnector {
    fn dump_to(&self, out: &mut dyn fmt::Write, indent: &str) -> fmt::Result {
        writeln!(out, "{self}")?;
        dump_children(out, indent, &[&*self.manager as &dyn Dump])
    }
}

impl fmt::Display for SelectConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self.local_addr().unwrap_or(self.config.addr);
        write!(
            f,
            "SelectConnector@{}{{{},acceptors={},accepted={}}}",
            addr,
            self.state.get(),
            self.config.acceptors,
            self.accepted()
        )
    }
}
