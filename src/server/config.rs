//! Server configuration.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Default SOCKS5 listen port.
pub const DEFAULT_PORT: u16 = 1080;

/// Server configuration, fixed before the listener starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: Ipv4Addr,
    /// Listen port
    pub listen_port: u16,
    /// Pending-connection queue length
    pub backlog: u32,
    /// Bound on each handshake read, lookup, connect and write
    pub io_timeout: Duration,
    /// Per-direction relay buffer size
    pub buffer_size: usize,
    /// Maximum concurrent relay pairs
    pub max_pairs: usize,
    /// How long shutdown waits for connections to finish
    pub drain_timeout: Duration,
    /// Process start time
    pub start_time: DateTime<Utc>,
}

impl ServerConfig {
    /// Configuration listening on all interfaces at `port`.
    pub fn new(port: u16) -> Self {
        Self {
            listen_addr: Ipv4Addr::UNSPECIFIED,
            listen_port: port,
            backlog: 10,
            io_timeout: Duration::from_secs(2),
            buffer_size: 8192,
            max_pairs: 1024,
            drain_timeout: Duration::from_secs(5),
            start_time: Utc::now(),
        }
    }

    /// Socket address to bind.
    pub fn listen_socket(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.listen_addr, self.listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.io_timeout.is_zero() {
            return Err(Error::config("io_timeout must be non-zero"));
        }
        if self.buffer_size == 0 {
            return Err(Error::config("buffer_size must be non-zero"));
        }
        if self.max_pairs == 0 {
            return Err(Error::config("max_pairs must be non-zero"));
        }
        if self.backlog == 0 {
            return Err(Error::config("backlog must be non-zero"));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}
