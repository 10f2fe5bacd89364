//! SOCKS5 handshake negotiation.
//!
//! Drives one accepted client from method negotiation to an established
//! upstream connection (or a rejection). Every read, lookup, connect and
//! write is a separate await point bounded by the I/O timeout, so the task
//! yields the reactor between steps instead of blocking it.
//!
//! ```text
//! AwaitMethods ─▶ AwaitRequest ─▶ AwaitAddress ─▶ Connecting ─▶ Established
//!      │               │               │               │
//!      └── Failed      ├── Rejected    ├── Rejected    └── Rejected
//!                      └── Failed      └── Failed
//! ```

use std::future::Future;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::proxy::codec::{
    self, Command, HandshakeRequest, Reply, RequestHeader, TargetAddr, ATYP_DOMAIN, ATYP_IPV4,
    SOCKS5_VERSION,
};

/// Name-resolution collaborator used for domain destinations.
pub trait Resolver: Send + Sync + 'static {
    /// Resolve `host` to a single IPv4 socket address.
    fn resolve(&self, host: &str, port: u16)
        -> impl Future<Output = Result<SocketAddrV4>> + Send;
}

/// Resolver backed by the system lookup (`getaddrinfo`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddrV4> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Resolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| Error::Resolution {
                host: host.to_string(),
                reason: "no IPv4 address".into(),
            })
    }
}

/// Position of a connection in the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for `ver | nmethods | methods`
    AwaitMethods,
    /// No-auth selected, waiting for the request header
    AwaitRequest,
    /// Header accepted, waiting for the destination address
    AwaitAddress(RequestHeader),
    /// Destination resolved, opening the upstream connection
    Connecting {
        /// Destination as requested
        requested: TargetAddr,
        /// Address actually dialed
        target: SocketAddrV4,
    },
    /// Upstream connected and success reply sent
    Established,
    /// Refused with a protocol reply
    Rejected(Reply),
    /// Dropped without a reply
    Failed,
}

/// Both sockets of a successful negotiation.
#[derive(Debug)]
pub struct Established {
    /// Accepted client socket
    pub client: TcpStream,
    /// Connected upstream socket
    pub upstream: TcpStream,
    /// Client peer address
    pub client_addr: SocketAddr,
    /// Destination as the client named it
    pub requested: TargetAddr,
    /// Upstream peer address, echoed in the success reply
    pub bound: SocketAddrV4,
}

/// Terminal result of [`Connection::negotiate`].
#[derive(Debug)]
pub enum Outcome {
    /// Ownership of both sockets passes to the caller
    Established(Established),
    /// A reply was sent and the client closed
    Rejected {
        /// Reply code sent
        reply: Reply,
        /// Cause
        error: Error,
    },
    /// Client closed without a reply
    Failed(Error),
}

impl Outcome {
    /// Terminal state this outcome corresponds to.
    pub fn state(&self) -> HandshakeState {
        match self {
            Outcome::Established(_) => HandshakeState::Established,
            Outcome::Rejected { reply, .. } => HandshakeState::Rejected(*reply),
            Outcome::Failed(_) => HandshakeState::Failed,
        }
    }
}

/// A client socket during negotiation.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: HandshakeState,
    scratch: BytesMut,
    io_timeout: Duration,
}

impl Connection {
    /// Wrap a freshly accepted client.
    pub fn new(stream: TcpStream, peer: SocketAddr, io_timeout: Duration) -> Self {
        Self {
            stream,
            peer,
            state: HandshakeState::AwaitMethods,
            scratch: BytesMut::with_capacity(262),
            io_timeout,
        }
    }

    /// Run the state machine to a terminal state.
    pub async fn negotiate<R: Resolver>(mut self, resolver: &R) -> Outcome {
        loop {
            let current = std::mem::replace(&mut self.state, HandshakeState::Failed);
            let step = match current {
                HandshakeState::AwaitMethods => self.read_methods().await,
                HandshakeState::AwaitRequest => self.read_request_header().await,
                HandshakeState::AwaitAddress(header) => self.read_address(header, resolver).await,
                HandshakeState::Connecting { requested, target } => {
                    match self.connect(target).await {
                        Ok((upstream, bound)) => {
                            tracing::debug!("{} -> {} connected ({})", self.peer, requested, bound);
                            return Outcome::Established(Established {
                                client: self.stream,
                                upstream,
                                client_addr: self.peer,
                                requested,
                                bound,
                            });
                        }
                        Err(e) => Err(e),
                    }
                }
                terminal => {
                    return Outcome::Failed(Error::handshake(format!(
                        "negotiation resumed in terminal state {:?}",
                        terminal
                    )))
                }
            };

            match step {
                Ok(next) => self.state = next,
                Err(error) => return self.finish(error).await,
            }
        }
    }

    async fn read_methods(&mut self) -> Result<HandshakeState> {
        self.scratch.clear();
        self.fill(2, "method header", Error::MalformedHandshake).await?;

        if self.scratch[0] != SOCKS5_VERSION {
            return Err(Error::handshake(format!(
                "unexpected version 0x{:02x}",
                self.scratch[0]
            )));
        }

        let count = self.scratch[1] as usize;
        self.fill(count, "method list", Error::MalformedHandshake).await?;
        let request = codec::parse_method_request(&self.scratch)?;
        tracing::trace!("{} offered methods {:?}", self.peer, request.methods);

        self.send(&codec::build_method_response(), "method reply").await?;
        Ok(HandshakeState::AwaitRequest)
    }

    async fn read_request_header(&mut self) -> Result<HandshakeState> {
        self.scratch.clear();
        self.fill(codec::REQUEST_HEADER_LEN, "request header", Error::MalformedRequest)
            .await?;
        let header = codec::parse_request_header(&self.scratch)?;

        if header.version != SOCKS5_VERSION {
            return Err(Error::VersionMismatch {
                expected: SOCKS5_VERSION,
                actual: header.version,
                atype: header.atype,
            });
        }
        if header.command != Command::Connect {
            return Err(Error::UnsupportedCommand {
                command: header.command.as_u8(),
                atype: header.atype,
            });
        }
        if header.address_prefix_len().is_none() {
            return Err(Error::UnsupportedAddressType(header.atype));
        }

        Ok(HandshakeState::AwaitAddress(header))
    }

    async fn read_address<R: Resolver>(
        &mut self,
        header: RequestHeader,
        resolver: &R,
    ) -> Result<HandshakeState> {
        let prefix = header
            .address_prefix_len()
            .ok_or(Error::UnsupportedAddressType(header.atype))?;
        self.fill(prefix, "destination address", Error::MalformedRequest)
            .await?;

        if header.atype == ATYP_DOMAIN {
            let name_len = self.scratch[self.scratch.len() - 1] as usize;
            self.fill(name_len, "destination name", Error::MalformedRequest)
                .await?;
        }
        self.fill(2, "destination port", Error::MalformedRequest)
            .await?;

        let HandshakeRequest { target, .. } = codec::parse_request(&self.scratch)?;
        let resolved = match &target {
            TargetAddr::Ipv4(addr) => *addr,
            TargetAddr::Domain(host, port) => {
                let lookup = resolver.resolve(host, *port);
                match timeout(self.io_timeout, lookup).await {
                    Ok(result) => result?,
                    Err(_) => return Err(self.timed_out("name resolution")),
                }
            }
        };
        tracing::debug!("{} requests {} ({})", self.peer, target, resolved);

        Ok(HandshakeState::Connecting {
            requested: target,
            target: resolved,
        })
    }

    async fn connect(&mut self, target: SocketAddrV4) -> Result<(TcpStream, SocketAddrV4)> {
        let upstream = match timeout(self.io_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(Error::UpstreamConnect { target, source }),
            Err(_) => {
                return Err(Error::UpstreamConnect {
                    target,
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        };

        let bound = match upstream.peer_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(Error::Network(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("upstream peer {} is not IPv4", addr),
                )))
            }
        };
        if let Err(e) = upstream.set_nodelay(true) {
            tracing::trace!("set_nodelay on upstream {} failed: {}", bound, e);
        }

        let reply = codec::build_reply(Reply::Succeeded, ATYP_IPV4, Some(bound));
        self.send(&reply, "success reply").await?;
        Ok((upstream, bound))
    }

    async fn finish(mut self, error: Error) -> Outcome {
        match error.reply() {
            Some((reply, atype)) => {
                let frame = codec::build_reply(reply, atype, None);
                if let Err(e) = self.send(&frame, "error reply").await {
                    tracing::trace!("{} error reply not delivered: {}", self.peer, e);
                }
                tracing::debug!("{} rejected: {}", self.peer, error);
                Outcome::Rejected { reply, error }
            }
            None => {
                tracing::debug!("{} handshake failed: {}", self.peer, error);
                Outcome::Failed(error)
            }
        }
    }

    /// Append exactly `len` bytes from the client to the scratch buffer.
    async fn fill(
        &mut self,
        len: usize,
        step: &'static str,
        malformed: fn(String) -> Error,
    ) -> Result<()> {
        let start = self.scratch.len();
        self.scratch.resize(start + len, 0);

        let read = self.stream.read_exact(&mut self.scratch[start..]);
        match timeout(self.io_timeout, read).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(malformed(format!("connection closed during {}", step)))
            }
            Ok(Err(e)) => Err(Error::Network(e)),
            Err(_) => Err(self.timed_out(step)),
        }
    }

    async fn send(&mut self, data: &[u8], step: &'static str) -> Result<()> {
        match timeout(self.io_timeout, self.stream.write_all(data)).await {
            Ok(result) => result.map_err(Error::Network),
            Err(_) => Err(self.timed_out(step)),
        }
    }

    fn timed_out(&self, step: &'static str) -> Error {
        Error::Timeout {
            step,
            millis: self.io_timeout.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    const IO_TIMEOUT: Duration = Duration::from_millis(500);

    /// Resolver answering from a fixed table.
    #[derive(Default)]
    struct StaticResolver {
        hosts: HashMap<String, SocketAddrV4>,
        calls: AtomicUsize,
    }

    impl Resolver for StaticResolver {
        async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddrV4> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.hosts
                .get(host)
                .map(|addr| SocketAddrV4::new(*addr.ip(), port))
                .ok_or_else(|| Error::Resolution {
                    host: host.to_string(),
                    reason: "unknown host".into(),
                })
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    fn spawn_negotiation(
        server: TcpStream,
        peer: SocketAddr,
        resolver: std::sync::Arc<StaticResolver>,
    ) -> tokio::task::JoinHandle<Outcome> {
        tokio::spawn(async move {
            Connection::new(server, peer, IO_TIMEOUT)
                .negotiate(resolver.as_ref())
                .await
        })
    }

    async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = match target.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            _ => unreachable!(),
        };

        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, Default::default());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&target_addr.ip().octets());
        request.extend_from_slice(&target_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], &target_addr.ip().octets());
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), target_addr.port());

        match handle.await.unwrap() {
            Outcome::Established(established) => {
                assert_eq!(established.bound, target_addr);
                assert_eq!(established.requested, TargetAddr::Ipv4(target_addr));
                assert_eq!(established.client_addr, peer);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_auth_selected_regardless_of_offer() {
        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, Default::default());

        // Offers only GSSAPI and username/password.
        client.write_all(&[0x05, 0x02, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        drop(client);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.state(), HandshakeState::Failed);
        assert!(matches!(outcome, Outcome::Failed(Error::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_bind_and_udp_rejected() {
        for command in [codec::CMD_BIND, codec::CMD_UDP_ASSOCIATE] {
            let (mut client, server, peer) = socket_pair().await;
            let handle = spawn_negotiation(server, peer, Default::default());

            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            // The header alone decides the rejection; nothing else is read.
            client
                .write_all(&[0x05, command, 0x00, 0x01])
                .await
                .unwrap();

            let reply = read_to_end(&mut client).await;
            assert_eq!(reply, vec![0x05, 0x00, 0x05, 0x07, 0x00, 0x01]);

            let outcome = handle.await.unwrap();
            assert_eq!(
                outcome.state(),
                HandshakeState::Rejected(Reply::CommandNotSupported)
            );
        }
    }

    #[tokio::test]
    async fn test_ipv6_rejected_without_resolution() {
        let resolver = std::sync::Arc::new(StaticResolver::default());
        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, resolver.clone());

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, codec::ATYP_IPV6])
            .await
            .unwrap();

        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, vec![0x05, 0x00, 0x05, 0x08, 0x00, 0x04]);

        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome.state(),
            HandshakeState::Rejected(Reply::AddressTypeNotSupported)
        );
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_domain_resolved_through_collaborator() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let mut resolver = StaticResolver::default();
        resolver
            .hosts
            .insert("upstream.test".into(), "127.0.0.1:0".parse().unwrap());
        let resolver = std::sync::Arc::new(resolver);

        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, resolver.clone());

        let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 13];
        request.extend_from_slice(b"upstream.test");
        request.extend_from_slice(&port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[0x05, 0x00]);
        assert_eq!(&reply[2..6], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(u16::from_be_bytes([reply[10], reply[11]]), port);

        match handle.await.unwrap() {
            Outcome::Established(established) => {
                assert_eq!(
                    established.requested,
                    TargetAddr::Domain("upstream.test".into(), port)
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolution_failure_sends_no_reply() {
        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, Default::default());

        let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 7];
        request.extend_from_slice(b"nowhere");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        // Only the method reply arrives before the close.
        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, vec![0x05, 0x00]);

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(Error::Resolution { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_replies() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, Default::default());

        let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, vec![0x05, 0x00, 0x05, 0x07, 0x00, 0x01]);

        let outcome = handle.await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                error: Error::UpstreamConnect { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wrong_method_version_fails_silently() {
        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, Default::default());

        client.write_all(&[0x04, 0x01]).await.unwrap();
        let reply = read_to_end(&mut client).await;
        assert!(reply.is_empty());

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(Error::MalformedHandshake(_))));
    }

    #[tokio::test]
    async fn test_wrong_request_version_rejected() {
        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, Default::default());

        client
            .write_all(&[0x05, 0x01, 0x00, 0x04, 0x01, 0x00, 0x01])
            .await
            .unwrap();
        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, vec![0x05, 0x00, 0x05, 0x07, 0x00, 0x01]);

        let outcome = handle.await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                error: Error::VersionMismatch { actual: 0x04, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stalled_client_times_out() {
        let (_client, server, peer) = socket_pair().await;
        let outcome = Connection::new(server, peer, Duration::from_millis(50))
            .negotiate(&StaticResolver::default())
            .await;

        assert!(matches!(
            outcome,
            Outcome::Failed(Error::Timeout {
                step: "method header",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_empty_method_list_still_selects_no_auth() {
        let (mut client, server, peer) = socket_pair().await;
        let handle = spawn_negotiation(server, peer, Default::default());

        client.write_all(&[0x05, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        drop(client);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_unknown_address_types_rejected() {
        for atype in [0x00, 0x05] {
            let resolver = std::sync::Arc::new(StaticResolver::default());
            let (mut client, server, peer) = socket_pair().await;
            let handle = spawn_negotiation(server, peer, resolver.clone());

            client
                .write_all(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00, atype])
                .await
                .unwrap();

            let reply = read_to_end(&mut client).await;
            assert_eq!(reply, vec![0x05, 0x00, 0x05, 0x08, 0x00, atype]);

            let outcome = handle.await.unwrap();
            assert!(matches!(
                outcome,
                Outcome::Rejected {
                    reply: Reply::AddressTypeNotSupported,
                    error: Error::UnsupportedAddressType(t),
                } if t == atype
            ));
            assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_system_resolver_ipv4_only() {
        let resolved = SystemResolver.resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(resolved, "127.0.0.1:80".parse().unwrap());

        // An IPv6 literal resolves, but to nothing usable.
        let err = SystemResolver.resolve("::1", 80).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { ref host, .. } if host == "::1"));
        assert!(err.reply().is_none());
    }
}
