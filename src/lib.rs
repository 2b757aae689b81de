//! Spindle - Event-Driven Transport Core
//!
//! Architecture:
//! - Buffers: cursor-addressed byte storage (heap, anonymous mmap, file mmap)
//!   with zero-copy views
//! - Pools: shared bounded pool, per-worker cache, two-slot holder
//! - Network: blocking acceptors feeding mio selector sets; readiness is
//!   turned into jobs on the worker pool
//! - Threads: elastic worker pool over a two-lock growable queue
//!
//! ```text
//! acceptor ─► SelectorManager ─► SelectEndpoint::schedule ─► WorkerPool
//!                   ▲                                             │
//!                   └──────── interest changes ◄── Connection ◄───┘
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod lifecycle;
#[cfg(unix)]
pub mod network;
pub mod pool;
pub mod thread;

pub use buffer::{Access, Buf, BufMut, Buffer, BufferKind, Case, View};
pub use config::ServerConfig;
pub use error::{BufferError, Error, LifeCycleError, QueueError, Result};
pub use lifecycle::{Dump, LifeCycle, State};
pub use pool::{BufferPoolConfig, BufferSource, Buffers, ExchangeBuffers};
pub use thread::{ThreadPool, WorkerContext, WorkerPool, WorkerPoolConfig};
