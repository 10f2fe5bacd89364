//! Server metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Connections currently being negotiated or relayed
    active_connections: AtomicU64,
    /// Handshakes that produced a relay pair
    established_pairs: AtomicU64,
    /// Handshakes refused with a protocol reply
    rejected_handshakes: AtomicU64,
    /// Handshakes dropped without a reply
    failed_handshakes: AtomicU64,
    /// Connections dropped because the pair table was full
    dropped_connections: AtomicU64,
    /// Bytes relayed client to upstream
    bytes_outbound: AtomicU64,
    /// Bytes relayed upstream to client
    bytes_inbound: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            established_pairs: AtomicU64::new(0),
            rejected_handshakes: AtomicU64::new(0),
            failed_handshakes: AtomicU64::new(0),
            dropped_connections: AtomicU64::new(0),
            bytes_outbound: AtomicU64::new(0),
            bytes_inbound: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment established pair count.
    pub fn increment_established(&self) {
        self.established_pairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment rejected handshake count.
    pub fn increment_rejected(&self) {
        self.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failed handshake count.
    pub fn increment_failed(&self) {
        self.failed_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment dropped connection count.
    pub fn increment_dropped(&self) {
        self.dropped_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the byte counts of a finished pair.
    pub fn add_relayed(&self, outbound: u64, inbound: u64) {
        self.bytes_outbound.fetch_add(outbound, Ordering::Relaxed);
        self.bytes_inbound.fetch_add(inbound, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            established_pairs: self.established_pairs.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            failed_handshakes: self.failed_handshakes.load(Ordering::Relaxed),
            dropped_connections: self.dropped_connections.load(Ordering::Relaxed),
            bytes_outbound: self.bytes_outbound.load(Ordering::Relaxed),
            bytes_inbound: self.bytes_inbound.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"SOCKS5 Relay Metrics
====================
Uptime: {} seconds

Connections:
  Total:       {}
  Active:      {}
  Established: {}
  Rejected:    {}
  Failed:      {}
  Dropped:     {}

Traffic:
  Client -> upstream: {} bytes
  Upstream -> client: {} bytes

Establish rate: {:.1}%
Throughput:     {:.1} B/s
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.established_pairs,
            snapshot.rejected_handshakes,
            snapshot.failed_handshakes,
            snapshot.dropped_connections,
            snapshot.bytes_outbound,
            snapshot.bytes_inbound,
            snapshot.establish_rate() * 100.0,
            snapshot.throughput_bps(),
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since start
    pub uptime_secs: u64,
    /// Connections accepted
    pub total_connections: u64,
    /// Connections still open
    pub active_connections: u64,
    /// Handshakes that produced a pair
    pub established_pairs: u64,
    /// Handshakes refused with a reply
    pub rejected_handshakes: u64,
    /// Handshakes dropped without a reply
    pub failed_handshakes: u64,
    /// Clients dropped at capacity
    pub dropped_connections: u64,
    /// Bytes relayed client to upstream
    pub bytes_outbound: u64,
    /// Bytes relayed upstream to client
    pub bytes_inbound: u64,
}

impl MetricsSnapshot {
    /// Fraction of accepted connections that reached the relay phase.
    pub fn establish_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.established_pairs as f64 / self.total_connections as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_outbound + self.bytes_inbound) as f64 / self.uptime_secs as f64
        }
    }
}
