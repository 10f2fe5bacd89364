//! Listener and per-connection driver.
//!
//! ```text
//!  TcpListener ──accept──▶ Connection::negotiate ──▶ RelayPair::run
//!       │                        │                       │
//!       │                 Rejected / Failed         EOF / error / shutdown
//!       ▼                        ▼                       ▼
//!   Shutdown ─────────────▶ close client ─────────▶ teardown both sides
//! ```
//!
//! Every connection runs as its own task on the reactor; the acceptor only
//! accepts and spawns, so a slow handshake never holds up the next accept.

pub mod config;
mod context;
mod metrics;
pub mod shutdown;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use shutdown::{Shutdown, ShutdownSignal};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;

use crate::error::Result;
use crate::proxy::{Connection, Outcome, PairEnd, RelayPair, Resolver, SystemResolver};

/// Pause after an accept error that is not tied to a single connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before accepting again after `err`.
///
/// A refused or reset handshake only concerns that client. Anything else,
/// EMFILE under descriptor exhaustion for instance, would fail again at once.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Main server instance.
pub struct Server<R: Resolver = SystemResolver> {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    resolver: Arc<R>,
}

impl Server<SystemResolver> {
    /// Bind the listener described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_resolver(config, SystemResolver)
    }
}

impl<R: Resolver> Server<R> {
    /// Bind the listener, resolving domain destinations through `resolver`.
    pub fn bind_with_resolver(config: ServerConfig, resolver: R) -> Result<Self> {
        config.validate()?;

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::V4(config.listen_socket()))?;
        let listener = socket.listen(config.backlog)?;

        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext::new(config)),
            resolver: Arc::new(resolver),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state, for inspection.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Handle that stops [`Server::run`] when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.ctx.shutdown.clone()
    }

    /// Accept clients until shutdown is requested, then drain.
    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            ctx,
            resolver,
        } = self;

        tracing::info!("SOCKS5 relay listening on {}", listener.local_addr()?);

        let mut shutdown = ctx.shutdown.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if ctx.registry.is_full() {
                            ctx.metrics.increment_dropped();
                            tracing::warn!(
                                "Dropping {}: {} pairs already live",
                                peer,
                                ctx.registry.capacity()
                            );
                            continue;
                        }

                        tracing::debug!("SOCKS5 connection from {}", peer);
                        tasks.spawn(serve_client(
                            Arc::clone(&ctx),
                            Arc::clone(&resolver),
                            stream,
                            peer,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                        if let Some(pause) = accept_backoff(&e) {
                            tokio::time::sleep(pause).await;
                        }
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        tracing::info!(
            "Shutting down: {} connections open, {} pairs live",
            tasks.len(),
            ctx.active_pairs()
        );
        for record in ctx.registry.snapshot() {
            tracing::debug!(
                "pair {} still open: {} <-> {} for {:?}",
                record.id,
                record.client,
                record.upstream,
                record.age()
            );
        }

        let drained = tokio::time::timeout(ctx.config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("Aborting {} connections after drain timeout", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        Ok(())
    }
}

/// Negotiate one client and, on success, relay until the pair ends.
async fn serve_client<R: Resolver>(
    ctx: Arc<ServerContext>,
    resolver: Arc<R>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    ctx.metrics.increment_connections();

    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!("set_nodelay on {} failed: {}", peer, e);
    }

    let mut shutdown = ctx.shutdown.subscribe();
    let connection = Connection::new(stream, peer, ctx.config.io_timeout);
    let outcome = tokio::select! {
        outcome = connection.negotiate(resolver.as_ref()) => Some(outcome),
        _ = shutdown.recv() => None,
    };

    match outcome {
        Some(Outcome::Established(established)) => {
            match RelayPair::open(established, Arc::clone(&ctx.registry), ctx.config.buffer_size) {
                Ok(pair) => {
                    ctx.metrics.increment_established();
                    let summary = pair.run(shutdown.recv_owned()).await;
                    ctx.metrics
                        .add_relayed(summary.client_to_upstream, summary.upstream_to_client);

                    match summary.end {
                        PairEnd::Failed(e) => {
                            tracing::debug!("pair {} ended with error: {}", summary.id, e)
                        }
                        end => tracing::debug!("pair {} ended: {:?}", summary.id, end),
                    }
                }
                Err(e) => {
                    ctx.metrics.increment_dropped();
                    tracing::warn!("Dropping {}: {}", peer, e);
                }
            }
        }
        Some(outcome) => {
            if matches!(outcome, Outcome::Rejected { .. }) {
                ctx.metrics.increment_rejected();
            } else {
                ctx.metrics.increment_failed();
            }
            tracing::trace!("handshake with {} ended {:?}", peer, outcome.state());
        }
        None => tracing::debug!("handshake with {} abandoned for shutdown", peer),
    }

    ctx.metrics.decrement_connections();
}
