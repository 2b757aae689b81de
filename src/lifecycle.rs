//! Start/stop state machine and diagnostic dumps shared by the long-lived
//! components (worker pool, selector manager, connector).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::LifeCycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Failed = 4,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => State::Starting,
            2 => State::Started,
            3 => State::Stopping,
            4 => State::Failed,
            _ => State::Stopped,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Stopped => "STOPPED",
            State::Starting => "STARTING",
            State::Started => "STARTED",
            State::Stopping => "STOPPING",
            State::Failed => "FAILED",
        })
    }
}

/// Atomic holder for a [`State`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(State::Stopped as u8))
    }

    #[inline]
    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `from -> to`, or reports the state actually found.
    pub fn transition(&self, from: State, to: State) -> Result<(), State> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(State::from_u8)
    }

    /// `Stopped | Failed -> Starting`.
    pub fn begin_start(&self) -> Result<(), LifeCycleError> {
        match self.transition(State::Stopped, State::Starting) {
            Ok(()) => Ok(()),
            Err(State::Failed) => self
                .transition(State::Failed, State::Starting)
                .map_err(LifeCycleError::IllegalState),
            Err(found) => Err(LifeCycleError::IllegalState(found)),
        }
    }

    /// `Starting | Started -> Stopping`. `Ok(false)` when already stopped.
    pub fn begin_stop(&self) -> Result<bool, LifeCycleError> {
        loop {
            let found = self.get();
            match found {
                State::Stopped | State::Failed => return Ok(false),
                State::Stopping => return Err(LifeCycleError::IllegalState(found)),
                State::Starting | State::Started => {
                    if self.transition(found, State::Stopping).is_ok() {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

pub trait LifeCycle {
    fn start(&self) -> Result<(), LifeCycleError>;
    fn stop(&self) -> Result<(), LifeCycleError>;
    fn state(&self) -> State;

    fn is_running(&self) -> bool {
        matches!(self.state(), State::Starting | State::Started)
    }

    fn is_started(&self) -> bool {
        self.state() == State::Started
    }

    fn is_stopped(&self) -> bool {
        self.state() == State::Stopped
    }

    fn is_failed(&self) -> bool {
        self.state() == State::Failed
    }
}

/// Tree-shaped diagnostic output.
///
/// ```text
/// WorkerPool{worker-pool,2<=3<=8,i=1,q=0}
///  +- worker-pool-0 IDLE
///  +- worker-pool-1 RUNNING 12ms
/// ```
pub trait Dump {
    /// Writes this node's line and its children. Child lines start with
    /// `indent`.
    fn dump_to(&self, out: &mut dyn fmt::Write, indent: &str) -> fmt::Result;

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = self.dump_to(&mut out, "");
        out
    }
}

impl Dump for String {
    fn dump_to(&self, out: &mut dyn fmt::Write, _indent: &str) -> fmt::Result {
        writeln!(out, "{self}")
    }
}

/// Writes `children` as branches under the current node.
pub fn dump_children(out: &mut dyn fmt::Write, indent: &str, children: &[&dyn Dump]) -> fmt::Result {
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        write!(out, "{indent} +- ")?;
        let nested = format!("{indent}{}", if last { "    " } else { " |  " });
        child.dump_to(out, &nested)?;
    }
    Ok(())
}
