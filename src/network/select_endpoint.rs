//! Selector-managed endpoint
//!
//! ```text
//!   NeedsDispatch ──(retry)──┐
//!        ▲                   ▼
//!        │ rejected     Undispatched ◄──────────────┐
//!        └────────────── │ readiness                │ handle done
//!                        ▼                          │
//!                    Dispatched ────────────────────┘
//!                        │ Handled::Suspend
//!                        ▼
//!                  AsyncSuspended ──resume()──► Undispatched
//! ```
//!
//! All state lives behind one mutex. Interest is recomputed from that state
//! after every transition; a difference from what is registered queues one
//! update on the owning selector set, which applies it on its own thread.
//! mio readiness is edge triggered, so "no interest" is a deregistration and
//! every (re)registration reports readiness that is already pending.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::selector::{Change, SetShared};
use super::{ChannelEndpoint, Connection, EndPoint, Fill, Handled};
use crate::buffer::BufMut;
use crate::thread::WorkerContext;

/// Who owns an endpoint's handling right now. Ordered: everything below
/// `Dispatched` is waiting on the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum DispatchState {
    /// Ready but the last dispatch was rejected or deferred.
    NeedsDispatch = -1,
    Undispatched = 0,
    /// A worker is running the connection.
    Dispatched = 1,
    /// The connection parked itself until [`SelectEndpoint::resume`].
    AsyncSuspended = 2,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DispatchState::NeedsDispatch => "NEEDS_DISPATCH",
            DispatchState::Undispatched => "UNDISPATCHED",
            DispatchState::Dispatched => "DISPATCHED",
            DispatchState::AsyncSuspended => "ASYNC_SUSPENDED",
        })
    }
}

struct Dispatch {
    state: DispatchState,
    /// An idle expiry task owns the connection.
    idle_suspended: bool,
    /// False after a flush left bytes behind.
    writable: bool,
    read_blocked: bool,
    write_blocked: bool,
    registered: Option<Interest>,
    update_pending: bool,
    /// Readiness may be pending that the poller will not report again.
    /// Forces a reregistration once the endpoint is back with the selector.
    rearm: bool,
    /// `resume` arrived while still dispatched.
    redispatch: bool,
    removed: bool,
    idle_since: Instant,
}

pub struct SelectEndpoint {
    this: Weak<SelectEndpoint>,
    channel: ChannelEndpoint,
    token: Token,
    set: Arc<SetShared>,
    dispatch: Mutex<Dispatch>,
    blocked: Condvar,
    connection: Mutex<Option<Box<dyn Connection>>>,
    close_notified: AtomicBool,
}

impl SelectEndpoint {
    pub(crate) fn new(stream: TcpStream, token: Token, set: Arc<SetShared>) -> Arc<Self> {
        let channel = ChannelEndpoint::new(stream);
        channel.set_max_idle_time(set.max_idle);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            channel,
            token,
            set,
            dispatch: Mutex::new(Dispatch {
                state: DispatchState::Undispatched,
                idle_suspended: false,
                writable: true,
                read_blocked: false,
                write_blocked: false,
                registered: None,
                update_pending: false,
                rearm: false,
                redispatch: false,
                removed: false,
                idle_since: Instant::now(),
            }),
            blocked: Condvar::new(),
            connection: Mutex::new(None),
            close_notified: AtomicBool::new(false),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn channel(&self) -> &ChannelEndpoint {
        &self.channel
    }

    /// Index of the selector set that owns this endpoint.
    pub fn selector_id(&self) -> usize {
        self.set.id
    }

    pub fn state(&self) -> DispatchState {
        self.dispatch.lock().state
    }

    /// Interest currently registered with the poller.
    pub fn registered_interest(&self) -> Option<Interest> {
        self.dispatch.lock().registered
    }

    pub fn is_writable(&self) -> bool {
        self.dispatch.lock().writable
    }

    /// Time since bytes last moved.
    pub fn idle_for(&self) -> Duration {
        self.dispatch.lock().idle_since.elapsed()
    }

    pub(crate) fn set_connection(&self, connection: Box<dyn Connection>) {
        *self.connection.lock() = Some(connection);
    }

    /// Selector thread: readiness arrived for this endpoint.
    pub(crate) fn schedule(&self, readable: bool, writable: bool) {
        let mut d = self.dispatch.lock();
        trace!(token = self.token.0, readable, writable, state = %d.state, "schedule");

        if !self.channel.is_open() {
            d.read_blocked = false;
            d.write_blocked = false;
            self.blocked.notify_all();
            self.update_key_locked(&mut d, false);
            return;
        }

        if d.read_blocked || d.write_blocked {
            if d.read_blocked && readable {
                d.read_blocked = false;
            }
            if d.write_blocked && writable {
                d.write_blocked = false;
            }
            if d.state >= DispatchState::Dispatched {
                d.rearm = true;
            }
            self.blocked.notify_all();
            self.update_key_locked(&mut d, false);
            return;
        }

        if writable && d.registered.is_some_and(|i| i.is_writable()) {
            d.writable = true;
        }
        if d.state < DispatchState::Dispatched {
            self.dispatch_locked(&mut d);
        } else {
            // the event is consumed; nothing re-fires it once the worker is done
            d.rearm = true;
        }
        self.update_key_locked(&mut d, false);
    }

    /// Hands the connection to a worker unless one already has it.
    pub fn dispatch(&self) {
        let mut d = self.dispatch.lock();
        self.dispatch_locked(&mut d);
        self.update_key_locked(&mut d, false);
    }

    fn dispatch_locked(&self, d: &mut Dispatch) {
        if d.state > DispatchState::Undispatched {
            return;
        }
        if d.idle_suspended {
            d.state = DispatchState::NeedsDispatch;
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        d.state = DispatchState::Dispatched;
        if !self.set.pool.dispatch(Box::new(move |worker: &WorkerContext| this.run(worker))) {
            warn!(token = self.token.0, remote = ?self.channel.remote_addr(), "dispatch rejected");
            d.state = DispatchState::NeedsDispatch;
            self.update_key_locked(d, true);
        }
    }

    /// Leaves `AsyncSuspended` and dispatches again. While a worker still
    /// holds the connection the handle loop runs one more round instead.
    pub fn resume(&self) {
        let mut d = self.dispatch.lock();
        match d.state {
            DispatchState::Dispatched => d.redispatch = true,
            DispatchState::AsyncSuspended => {
                d.state = DispatchState::Undispatched;
                self.dispatch_locked(&mut d);
            }
            DispatchState::Undispatched | DispatchState::NeedsDispatch => self.dispatch_locked(&mut d),
        }
        self.update_key_locked(&mut d, false);
    }

    fn desired_interest(&self, d: &Dispatch) -> Option<Interest> {
        let undispatched = d.state < DispatchState::Dispatched;
        let read = !self.channel.is_input_shutdown() && (d.read_blocked || undispatched);
        let write = !self.channel.is_output_shutdown() && (d.write_blocked || (undispatched && !d.writable));
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Queues one update on the selector set when the registration has to
    /// change. `force` re-arms an unchanged registration.
    ///
    /// At most one update is pending per endpoint; it reads the state when
    /// applied, not when queued.
    fn update_key_locked(&self, d: &mut Dispatch, force: bool) {
        if d.removed {
            return;
        }
        if force {
            d.rearm = true;
        }
        let change = !self.channel.is_open()
            || self.desired_interest(d) != d.registered
            || (d.rearm && d.state < DispatchState::Dispatched && d.registered.is_some());
        if !change || d.update_pending {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        d.update_pending = true;
        self.set.push(Change::Update(this));
    }

    /// Selector thread: brings the poller registration in line with the
    /// current state. `false` once the endpoint is closed and deregistered.
    pub(crate) fn apply_update(&self, registry: &Registry) -> bool {
        let mut d = self.dispatch.lock();
        d.update_pending = false;
        let rearm = std::mem::take(&mut d.rearm);
        let fd = self.channel.raw_fd();

        if !self.channel.is_open() {
            if d.registered.take().is_some() {
                let _ = registry.deregister(&mut SourceFd(&fd));
            }
            d.removed = true;
            d.read_blocked = false;
            d.write_blocked = false;
            self.blocked.notify_all();
            return false;
        }

        let desired = self.desired_interest(&d);
        let result = match (d.registered, desired) {
            (None, Some(interest)) => registry.register(&mut SourceFd(&fd), self.token, interest),
            (Some(current), Some(interest)) if current != interest || rearm => {
                registry.reregister(&mut SourceFd(&fd), self.token, interest)
            }
            (Some(_), None) => registry.deregister(&mut SourceFd(&fd)),
            _ => Ok(()),
        };

        match result {
            Ok(()) => {
                trace!(token = self.token.0, ?desired, rearm, "interest updated");
                d.registered = desired;
                true
            }
            Err(e) => {
                debug!(token = self.token.0, error = %e, "registration failed");
                d.registered = None;
                d.removed = true;
                drop(d);
                let _ = self.channel.close();
                self.blocked.notify_all();
                false
            }
        }
    }

    /// Worker thread: runs the connection until it has nothing more to do.
    fn run(self: Arc<Self>, worker: &WorkerContext) {
        loop {
            let suspended = self.handle_connection(worker);

            let mut d = self.dispatch.lock();
            if d.redispatch {
                d.redispatch = false;
                continue;
            }
            if suspended {
                d.state = DispatchState::AsyncSuspended;
            } else {
                d.state = DispatchState::Undispatched;
            }
            self.update_key_locked(&mut d, false);
            return;
        }
    }

    /// One round of `handle`, following upgrades. `true` when the
    /// connection suspended itself.
    fn handle_connection(self: &Arc<Self>, worker: &WorkerContext) -> bool {
        let mut guard = self.connection.lock();
        let mut suspended = false;

        if let Some(connection) = guard.as_mut() {
            loop {
                match connection.handle(self, worker) {
                    Ok(Handled::Continue) => break,
                    Ok(Handled::Suspend) => {
                        suspended = true;
                        break;
                    }
                    Ok(Handled::Upgrade(next)) => {
                        debug!(token = self.token.0, "connection upgraded");
                        *connection = next;
                    }
                    Err(e) => {
                        debug!(token = self.token.0, error = %e, "handle failed");
                        let _ = self.channel.close();
                        break;
                    }
                }
            }
        }
        drop(guard);

        if !self.channel.is_open() {
            self.notify_closed(true);
        }
        suspended
    }

    /// Selector thread: starts an idle expiry when the endpoint has been
    /// quiet for longer than its max idle time.
    pub(crate) fn check_idle(&self, now: Instant) {
        let Some(max_idle) = self.channel.max_idle_time() else {
            return;
        };
        let mut d = self.dispatch.lock();
        if d.state != DispatchState::Undispatched || d.idle_suspended || !self.channel.is_open() {
            return;
        }
        let idle = now.saturating_duration_since(d.idle_since);
        if idle < max_idle {
            return;
        }
        let Some(connection) = self.connection.try_lock() else {
            return;
        };
        if !connection.as_ref().map_or(true, |c| c.is_idle()) {
            return;
        }
        drop(connection);
        let Some(this) = self.this.upgrade() else {
            return;
        };

        d.idle_suspended = true;
        d.idle_since = now;
        let task = Arc::clone(&this);
        if !self.set.pool.dispatch(Box::new(move |_: &WorkerContext| task.expire_idle(idle))) {
            drop(d);
            this.expire_idle(idle);
        }
    }

    fn expire_idle(&self, idle: Duration) {
        {
            let mut guard = self.connection.lock();
            if let Some(connection) = guard.as_mut() {
                connection.on_idle_expired(self, idle);
            } else {
                let _ = self.channel.close();
            }
        }
        if !self.channel.is_open() {
            self.notify_closed(true);
        }

        let mut d = self.dispatch.lock();
        d.idle_suspended = false;
        d.idle_since = Instant::now();
        if d.state == DispatchState::NeedsDispatch {
            self.dispatch_locked(&mut d);
        }
        self.update_key_locked(&mut d, false);
    }

    /// Runs `on_close` once. Without `wait` it gives up when the connection
    /// is busy; whoever holds it notifies when done.
    pub(crate) fn notify_closed(&self, wait: bool) {
        let guard = if wait {
            Some(self.connection.lock())
        } else {
            self.connection.try_lock()
        };
        let Some(mut guard) = guard else {
            return;
        };
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(token = self.token.0, remote = ?self.channel.remote_addr(), "endpoint closed");
        if let Some(connection) = guard.as_mut() {
            connection.on_close();
        }
    }

    fn touch(&self, d: &mut Dispatch) {
        d.idle_since = Instant::now();
    }

    fn after_flush(&self, written: usize, left: bool) {
        let mut d = self.dispatch.lock();
        if written == 0 && left {
            d.writable = false;
        } else if written > 0 {
            d.writable = true;
            self.touch(&mut d);
        }
    }

    /// Blocks the calling worker on the condition the selector signals.
    fn block(&self, timeout: Duration, read: bool) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut d = self.dispatch.lock();
        if !self.channel.is_open() {
            return Ok(false);
        }
        if read {
            d.read_blocked = true;
        } else {
            d.write_blocked = true;
        }
        self.update_key_locked(&mut d, false);

        loop {
            let waiting = if read { d.read_blocked } else { d.write_blocked };
            if !waiting {
                break;
            }
            if self.blocked.wait_until(&mut d, deadline).timed_out() {
                break;
            }
        }

        let ready = if read {
            !std::mem::replace(&mut d.read_blocked, false)
        } else {
            !std::mem::replace(&mut d.write_blocked, false)
        };
        self.update_key_locked(&mut d, false);
        Ok(ready && self.channel.is_open())
    }

    fn changed(&self) {
        let mut d = self.dispatch.lock();
        self.update_key_locked(&mut d, false);
    }
}

impl EndPoint for SelectEndpoint {
    fn fill(&self, buffer: &mut dyn BufMut) -> io::Result<Fill> {
        let fill = self.channel.fill(buffer);
        match &fill {
            Ok(Fill::Bytes(n)) if *n > 0 => self.touch(&mut self.dispatch.lock()),
            Ok(Fill::Bytes(_)) => {}
            _ => self.changed(),
        }
        fill
    }

    fn flush(&self, buffer: &mut dyn BufMut) -> io::Result<usize> {
        let written = self.channel.flush(buffer)?;
        self.after_flush(written, buffer.has_content());
        Ok(written)
    }

    fn flush_all(
        &self,
        mut header: Option<&mut dyn BufMut>,
        mut body: Option<&mut dyn BufMut>,
        mut trailer: Option<&mut dyn BufMut>,
    ) -> io::Result<usize> {
        let written = self
            .channel
            .flush_all(
                header.as_mut().map(|b| &mut **b as &mut dyn BufMut),
                body.as_mut().map(|b| &mut **b as &mut dyn BufMut),
                trailer.as_mut().map(|b| &mut **b as &mut dyn BufMut),
            )?;
        let left = [header.as_deref(), body.as_deref(), trailer.as_deref()]
            .into_iter()
            .flatten()
            .any(|b| b.has_content());
        self.after_flush(written, left);
        Ok(written)
    }

    fn shutdown_input(&self) -> io::Result<()> {
        let result = self.channel.shutdown_input();
        self.changed();
        result
    }

    fn shutdown_output(&self) -> io::Result<()> {
        let result = self.channel.shutdown_output();
        self.changed();
        result
    }

    fn is_input_shutdown(&self) -> bool {
        self.channel.is_input_shutdown()
    }

    fn is_output_shutdown(&self) -> bool {
        self.channel.is_output_shutdown()
    }

    fn close(&self) -> io::Result<()> {
        let result = self.channel.close();
        self.blocked.notify_all();
        self.changed();
        result
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    fn is_blocking(&self) -> bool {
        false
    }

    fn block_readable(&self, timeout: Duration) -> io::Result<bool> {
        if self.channel.is_input_shutdown() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input is shut down"));
        }
        self.block(timeout, true)
    }

    fn block_writable(&self, timeout: Duration) -> io::Result<bool> {
        if self.channel.is_output_shutdown() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "output is shut down"));
        }
        self.block(timeout, false)
    }

    fn max_idle_time(&self) -> Option<Duration> {
        self.channel.max_idle_time()
    }

    fn set_max_idle_time(&self, max_idle: Option<Duration>) {
        self.channel.set_max_idle_time(max_idle);
    }
}

impl fmt::Display for SelectEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.dispatch.lock();
        write!(
            f,
            "SelectEndpoint@{}{{{:?}<->{:?},open={},ishut={},oshut={},{},w={},i={:?}}}",
            self.token.0,
            self.channel.remote_addr(),
            self.channel.local_addr(),
            self.channel.is_open(),
            self.channel.is_input_shutdown(),
            self.channel.is_output_shutdown(),
            d.state,
            d.writable,
            d.registered,
        )
    }
}

impl fmt::Debug for SelectEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
