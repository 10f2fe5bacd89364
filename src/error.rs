//! Error types for the SOCKS5 relay.

use std::net::SocketAddrV4;

use thiserror::Error;

use crate::proxy::codec::{Reply, ATYP_IPV4};

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or relaying a connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Method negotiation bytes were truncated or carried the wrong version
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    /// Request bytes were truncated or otherwise invalid
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Request header carried a version other than 5
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this server speaks
        expected: u8,
        /// Version the client sent
        actual: u8,
        /// Address type echoed in the reply
        atype: u8,
    },

    /// Command other than CONNECT
    #[error("command 0x{command:02x} not supported")]
    UnsupportedCommand {
        /// Command byte the client sent
        command: u8,
        /// Address type echoed in the reply
        atype: u8,
    },

    /// Address type other than IPv4 or domain name
    #[error("address type 0x{0:02x} not supported")]
    UnsupportedAddressType(u8),

    /// Domain lookup produced no usable IPv4 address
    #[error("failed to resolve {host}: {reason}")]
    Resolution {
        /// Name as the client sent it
        host: String,
        /// Why no address was usable
        reason: String,
    },

    /// Upstream TCP connect failed
    #[error("connect to {target} failed: {source}")]
    UpstreamConnect {
        /// Address that was dialed
        target: SocketAddrV4,
        /// Underlying connect error
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on an established pair
    #[error("relay I/O error ({direction}): {source}")]
    RelayIo {
        /// Which way the bytes were flowing
        direction: &'static str,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// Pair table is full
    #[error("pair limit of {0} reached")]
    ResourceExhausted(usize),

    /// A handshake step did not complete in time
    #[error("{step} timed out after {millis}ms")]
    Timeout {
        /// Handshake step that stalled
        step: &'static str,
        /// Timeout that elapsed
        millis: u64,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new malformed-handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::MalformedHandshake(msg.into())
    }

    /// Create a new malformed-request error
    pub fn request(msg: impl Into<String>) -> Self {
        Error::MalformedRequest(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// The reply code and atype byte sent to the client before closing, if any.
    ///
    /// Errors without a reply close the connection silently. Resolution
    /// failures deliberately fall in that group.
    pub fn reply(&self) -> Option<(Reply, u8)> {
        match self {
            Error::VersionMismatch { atype, .. } => Some((Reply::CommandNotSupported, *atype)),
            Error::UnsupportedCommand { atype, .. } => Some((Reply::CommandNotSupported, *atype)),
            Error::UnsupportedAddressType(atype) => {
                Some((Reply::AddressTypeNotSupported, *atype))
            }
            Error::UpstreamConnect { .. } => Some((Reply::CommandNotSupported, ATYP_IPV4)),
            _ => None,
        }
    }

    /// Check if this error is answered with a protocol-level reply
    pub fn is_rejection(&self) -> bool {
        self.reply().is_some()
    }
}
