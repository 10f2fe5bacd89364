//! SOCKS5 proxy core.
//!
//! `codec` handles the wire format, `handshake` negotiates one client up to
//! an upstream connection, `relay` forwards bytes for an established pair and
//! `registry` tracks which pairs are live.

pub mod codec;
pub mod handshake;
pub mod registry;
pub mod relay;

pub use handshake::{Connection, Outcome, Resolver, SystemResolver};
pub use registry::{PairId, PairRegistry};
pub use relay::{PairEnd, RelayPair, RelaySummary};
