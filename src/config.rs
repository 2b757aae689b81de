//! Server-wide configuration
//!
//! Aggregates the per-component settings. Each part has its own defaults;
//! `validate` checks them together before anything is started.

#[cfg(unix)]
use crate::error::LifeCycleError;
use crate::error::Error;
#[cfg(unix)]
use crate::network::ConnectorConfig;
use crate::pool::{BufferPoolConfig, ExchangeBuffers};
use crate::thread::WorkerPoolConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[cfg(unix)]
    pub connector: ConnectorConfig,
    pub workers: WorkerPoolConfig,
    pub request_buffers: BufferPoolConfig,
    pub response_buffers: BufferPoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            #[cfg(unix)]
            connector: ConnectorConfig::default(),
            workers: WorkerPoolConfig::default(),
            request_buffers: BufferPoolConfig::request(),
            response_buffers: BufferPoolConfig::response(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.workers.validate()?;
        self.request_buffers.layout().validated()?;
        self.response_buffers.layout().validated()?;
        #[cfg(unix)]
        {
            self.connector.validate()?;
            if self.connector.acceptors > self.workers.max_threads {
                return Err(LifeCycleError::Config(format!(
                    "{} acceptors exceed {} max worker threads",
                    self.connector.acceptors, self.workers.max_threads
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Builds the request and response pools.
    pub fn exchange_buffers(&self) -> Result<ExchangeBuffers, Error> {
        Ok(ExchangeBuffers::new(&self.request_buffers, &self.response_buffers)?)
    }
}
