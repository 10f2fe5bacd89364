//! Relay pair: two established sockets forwarding to each other.
//!
//! Each direction owns a buffer. Reading from the source side stops while
//! that buffer still holds bytes the destination has not accepted, and
//! resumes once it is drained. The first EOF or error on either side ends the
//! pair; both sockets are closed together, exactly once.

use std::future::Future;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::proxy::handshake::Established;
use crate::proxy::registry::{PairId, PairRegistry};

/// Forwarding direction within a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream
    Outbound,
    /// Upstream to client
    Inbound,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Outbound => "client->upstream",
            Direction::Inbound => "upstream->client",
        }
    }
}

/// Why a pair stopped relaying.
#[derive(Debug)]
pub enum PairEnd {
    /// The client closed its side
    ClientClosed,
    /// The upstream closed its side
    UpstreamClosed,
    /// Read or write failure
    Failed(Error),
    /// Server shutdown requested
    Shutdown,
    /// The pair had already been torn down
    AlreadyReleased,
}

/// Result of [`RelayPair::run`].
#[derive(Debug)]
pub struct RelaySummary {
    /// Pair identifier
    pub id: PairId,
    /// Termination cause
    pub end: PairEnd,
    /// Bytes delivered to the upstream
    pub client_to_upstream: u64,
    /// Bytes delivered to the client
    pub upstream_to_client: u64,
}

/// One forwarding direction with its outstanding-write buffer.
struct Pipe {
    direction: Direction,
    buf: Box<[u8]>,
    filled: usize,
    written: usize,
    transferred: u64,
}

impl Pipe {
    fn new(direction: Direction, size: usize) -> Self {
        Self {
            direction,
            buf: vec![0u8; size].into_boxed_slice(),
            filled: 0,
            written: 0,
            transferred: 0,
        }
    }

    /// Bytes read from the source that the destination has not accepted yet.
    fn pending(&self) -> usize {
        self.filled - self.written
    }

    /// Forward until the source reports EOF.
    async fn pump<R, W>(&mut self, src: &mut R, dst: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let direction = self.direction.label();
        let relay_err = |source| Error::RelayIo { direction, source };

        loop {
            if self.pending() == 0 {
                let n = src.read(&mut self.buf[..]).await.map_err(relay_err)?;
                if n == 0 {
                    return Ok(());
                }
                self.filled = n;
                self.written = 0;
            }

            let n = dst
                .write(&self.buf[self.written..self.filled])
                .await
                .map_err(relay_err)?;
            if n == 0 {
                return Err(relay_err(std::io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
            self.transferred += n as u64;
        }
    }
}

/// Client and upstream sockets of one proxied connection.
///
/// Both sockets live and die together: [`RelayPair::teardown`] closes both
/// and releases the registry entry, and any later call (including the one
/// made on drop) finds nothing left to release.
pub struct RelayPair {
    id: PairId,
    client: Option<TcpStream>,
    upstream: Option<TcpStream>,
    client_addr: SocketAddr,
    upstream_addr: SocketAddrV4,
    registry: Arc<PairRegistry>,
    buffer_size: usize,
}

impl RelayPair {
    /// Register a negotiated connection as a pair.
    ///
    /// If the registry refuses it, both sockets are closed before the error
    /// is returned.
    pub fn open(
        established: Established,
        registry: Arc<PairRegistry>,
        buffer_size: usize,
    ) -> Result<Self> {
        let Established {
            client,
            upstream,
            client_addr,
            bound,
            ..
        } = established;

        let id = registry.register(client_addr, bound)?;
        tracing::debug!("pair {} opened: {} <-> {}", id, client_addr, bound);

        Ok(Self {
            id,
            client: Some(client),
            upstream: Some(upstream),
            client_addr,
            upstream_addr: bound,
            registry,
            buffer_size: buffer_size.max(1),
        })
    }

    /// Pair identifier.
    pub fn id(&self) -> PairId {
        self.id
    }

    /// Whether both sockets have been closed.
    pub fn is_released(&self) -> bool {
        self.client.is_none() && self.upstream.is_none()
    }

    /// Relay until either side closes or fails, or `stop` completes, then
    /// tear the pair down.
    pub async fn run<F>(mut self, stop: F) -> RelaySummary
    where
        F: Future<Output = ()>,
    {
        let mut outbound = Pipe::new(Direction::Outbound, self.buffer_size);
        let mut inbound = Pipe::new(Direction::Inbound, self.buffer_size);

        let end = match (self.client.as_mut(), self.upstream.as_mut()) {
            (Some(client), Some(upstream)) => {
                let (mut client_rd, mut client_wr) = client.split();
                let (mut upstream_rd, mut upstream_wr) = upstream.split();

                tokio::select! {
                    result = outbound.pump(&mut client_rd, &mut upstream_wr) => match result {
                        Ok(()) => PairEnd::ClientClosed,
                        Err(e) => PairEnd::Failed(e),
                    },
                    result = inbound.pump(&mut upstream_rd, &mut client_wr) => match result {
                        Ok(()) => PairEnd::UpstreamClosed,
                        Err(e) => PairEnd::Failed(e),
                    },
                    _ = stop => PairEnd::Shutdown,
                }
            }
            _ => PairEnd::AlreadyReleased,
        };

        if outbound.pending() + inbound.pending() > 0 {
            tracing::trace!(
                "pair {} dropping {} undelivered bytes",
                self.id,
                outbound.pending() + inbound.pending()
            );
        }
        self.teardown();

        RelaySummary {
            id: self.id,
            end,
            client_to_upstream: outbound.transferred,
            upstream_to_client: inbound.transferred,
        }
    }

    /// Close both sockets and release the registry entry.
    ///
    /// Returns `true` only for the call that actually released the pair.
    pub fn teardown(&mut self) -> bool {
        if self.is_released() {
            return false;
        }

        let client = self.client.take();
        let upstream = self.upstream.take();
        drop(client);
        drop(upstream);

        match self.registry.release(self.id) {
            Some(record) => {
                tracing::debug!(
                    "pair {} closed: {} <-> {} after {:?}",
                    self.id,
                    self.client_addr,
                    self.upstream_addr,
                    record.age()
                );
            }
            None => {
                tracing::warn!("pair {} was not registered at teardown", self.id);
            }
        }
        true
    }
}

impl Drop for RelayPair {
    fn drop(&mut self) {
        self.teardown();
    }
}
