//! Per-worker state
//!
//! A [`WorkerContext`] is created by the thread that runs jobs (a pool
//! worker or a selector thread) and lent to every job it runs. It never
//! leaves that thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::pool::{BufferLayout, WorkerBuffers};

pub struct WorkerContext {
    name: String,
    buffers: RefCell<HashMap<u64, Rc<WorkerBuffers>>>,
}

impl WorkerContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffers: RefCell::new(HashMap::new()),
        }
    }

    /// Name of the owning thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This worker's cache for the per-worker source `source`, created on
    /// first use.
    pub(crate) fn worker_buffers(&self, source: u64, layout: BufferLayout) -> Rc<WorkerBuffers> {
        let mut buffers = self.buffers.borrow_mut();
        let cache = buffers
            .entry(source)
            .or_insert_with(|| Rc::new(WorkerBuffers::unchecked(layout)));
        Rc::clone(cache)
    }

    /// Buffers parked in this worker's caches.
    pub fn cached_buffers(&self) -> usize {
        self.buffers.borrow().values().map(|b| b.cached()).sum()
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("name", &self.name)
            .field("caches", &self.buffers.borrow().len())
            .finish()
    }
}
