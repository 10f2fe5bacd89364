//! Process-wide state shared by the acceptor and every connection task.

use std::sync::Arc;

use crate::proxy::PairRegistry;
use crate::server::config::ServerConfig;
use crate::server::metrics::ServerMetrics;
use crate::server::shutdown::Shutdown;

/// Everything a connection task may reach, built once at startup.
pub struct ServerContext {
    /// Read-only configuration
    pub config: ServerConfig,
    /// Live relay pairs
    pub registry: Arc<PairRegistry>,
    /// Aggregate counters
    pub metrics: ServerMetrics,
    /// Cooperative shutdown flag
    pub shutdown: Shutdown,
}

impl ServerContext {
    /// Build the context for `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(PairRegistry::new(config.max_pairs)),
            metrics: ServerMetrics::new(),
            shutdown: Shutdown::new(),
            config,
        }
    }

    /// Number of live relay pairs.
    pub fn active_pairs(&self) -> usize {
        self.registry.len()
    }
}
