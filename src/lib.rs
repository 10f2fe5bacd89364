//! # socks5-relay
//!
//! A minimal SOCKS5 CONNECT proxy. Clients negotiate "no authentication",
//! name an IPv4 or domain destination, and are then paired with an upstream
//! TCP connection; bytes flow both ways until either side closes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Acceptor (server)        listener, shutdown, metrics   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshake Negotiator     methods → request → connect   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Relay Pair + Registry    two sockets, one lifetime     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Wire Codec               RFC 1928 byte layouts         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All connections share one tokio reactor. Handshakes suspend at every read,
//! lookup and connect, so no client can stall another.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod proxy;

#[cfg(feature = "server")]
pub mod cli;
#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// SOCKS protocol version spoken by this crate.
pub const SOCKS_VERSION: u8 = proxy::codec::SOCKS5_VERSION;
