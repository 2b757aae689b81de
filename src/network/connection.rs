//! Protocol handlers bound to endpoints

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{EndPoint, SelectEndpoint};
use crate::thread::WorkerContext;

/// What the endpoint does after [`Connection::handle`] returns.
pub enum Handled {
    /// Keep the current connection; wait for the next readiness.
    Continue,
    /// Replace the connection and handle again immediately.
    Upgrade(Box<dyn Connection>),
    /// Stop dispatching until [`SelectEndpoint::resume`] is called.
    Suspend,
}

impl std::fmt::Debug for Handled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handled::Continue => f.write_str("Continue"),
            Handled::Upgrade(_) => f.write_str("Upgrade"),
            Handled::Suspend => f.write_str("Suspend"),
        }
    }
}

pub trait Connection: Send {
    /// Makes as much progress as the endpoint allows without blocking.
    /// `worker` is the context of the thread running this round; per-worker
    /// buffers are checked out from it and must not be kept past the call.
    fn handle(&mut self, endpoint: &Arc<SelectEndpoint>, worker: &WorkerContext) -> io::Result<Handled>;

    /// Called when the endpoint has seen no traffic for `idle`. The default
    /// half-closes first and closes fully on a second expiry.
    fn on_idle_expired(&mut self, endpoint: &SelectEndpoint, idle: Duration) {
        debug!(remote = ?endpoint.remote_addr(), ?idle, "idle expired");
        if endpoint.is_input_shutdown() || endpoint.is_output_shutdown() {
            let _ = endpoint.close();
        } else if endpoint.shutdown_output().is_err() {
            let _ = endpoint.close();
        }
    }

    /// Called once after the endpoint is closed and deregistered.
    fn on_close(&mut self) {}

    /// Whether idle expiry applies right now. A connection in the middle of a
    /// message can opt out.
    fn is_idle(&self) -> bool {
        true
    }
}

/// Creates the connection for each newly registered endpoint.
pub trait ConnectionFactory: Send + Sync {
    fn new_connection(&self, endpoint: &Arc<SelectEndpoint>) -> Box<dyn Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(&Arc<SelectEndpoint>) -> Box<dyn Connection> + Send + Sync,
{
    fn new_connection(&self, endpoint: &Arc<SelectEndpoint>) -> Box<dyn Connection> {
        self(endpoint)
    }
}
