//! SOCKS5 wire codec.
//!
//! Pure parsing and serialization of the method negotiation and CONNECT
//! request/reply layouts (RFC 1928). No I/O happens here; the negotiator
//! reads bytes off the socket and hands them in.
//!
//! ```text
//! method request:  ver(1) | nmethods(1) | methods(nmethods)
//! request:         ver(1) | cmd(1) | rsv(1) | atyp(1) | dst.addr | dst.port(2)
//! reply:           ver(1) | rep(1) | rsv(1) | atyp(1) [ | bnd.addr(4) | bnd.port(2) ]
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Protocol version handled by this codec.
pub const SOCKS5_VERSION: u8 = 0x05;

/// "No authentication required" method.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;
/// BIND command (recognized, rejected).
pub const CMD_BIND: u8 = 0x02;
/// UDP ASSOCIATE command (recognized, rejected).
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type.
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type (recognized, rejected).
pub const ATYP_IPV6: u8 = 0x04;

/// Size of the fixed request header (ver, cmd, rsv, atyp).
pub const REQUEST_HEADER_LEN: usize = 4;

/// Size of a success reply.
pub const SUCCESS_REPLY_LEN: usize = 10;

/// Size of an error reply.
pub const ERROR_REPLY_LEN: usize = 4;

/// Request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open an outbound TCP connection
    Connect,
    /// Accept an inbound connection
    Bind,
    /// Relay UDP datagrams
    UdpAssociate,
    /// Anything else
    Unknown(u8),
}

impl Command {
    /// Decode a command byte.
    pub fn from_u8(v: u8) -> Self {
        match v {
            CMD_CONNECT => Self::Connect,
            CMD_BIND => Self::Bind,
            CMD_UDP_ASSOCIATE => Self::UdpAssociate,
            other => Self::Unknown(other),
        }
    }

    /// Wire value of this command.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Connect => CMD_CONNECT,
            Self::Bind => CMD_BIND,
            Self::UdpAssociate => CMD_UDP_ASSOCIATE,
            Self::Unknown(v) => v,
        }
    }
}

/// Reply field of a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    /// Request granted
    Succeeded = 0x00,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

/// Parsed method negotiation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    /// Protocol version byte as sent
    pub version: u8,
    /// Offered authentication methods
    pub methods: Vec<u8>,
}

impl MethodRequest {
    /// Number of methods the client announced.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

/// Fixed four-byte header preceding the destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Protocol version byte as sent
    pub version: u8,
    /// Requested command
    pub command: Command,
    /// Raw address type byte
    pub atype: u8,
}

impl RequestHeader {
    /// Number of address bytes that follow the header, excluding the port.
    ///
    /// For domain names the single length byte is not known yet, so only the
    /// length prefix itself is counted. Returns `None` for address types that
    /// cannot be read.
    pub fn address_prefix_len(&self) -> Option<usize> {
        match self.atype {
            ATYP_IPV4 => Some(4),
            ATYP_DOMAIN => Some(1),
            _ => None,
        }
    }
}

/// Destination named in a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Raw IPv4 destination
    Ipv4(SocketAddrV4),
    /// Domain name still to be resolved
    Domain(String, u16),
}

impl TargetAddr {
    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            Self::Ipv4(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4(addr) => write!(f, "{}", addr),
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Parsed CONNECT (or rejected) request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol version byte as sent
    pub version: u8,
    /// Requested command
    pub command: Command,
    /// Destination address and port
    pub target: TargetAddr,
}

/// Parse `ver | nmethods | methods`.
pub fn parse_method_request(data: &[u8]) -> Result<MethodRequest> {
    if data.len() < 2 {
        return Err(Error::handshake(format!(
            "method request too short: {} bytes",
            data.len()
        )));
    }

    let version = data[0];
    let count = data[1] as usize;
    if data.len() < 2 + count {
        return Err(Error::handshake(format!(
            "method list truncated: announced {}, got {}",
            count,
            data.len() - 2
        )));
    }

    Ok(MethodRequest {
        version,
        methods: data[2..2 + count].to_vec(),
    })
}

/// The method selection reply.
///
/// The offered methods are not inspected; "no authentication" is always
/// selected.
pub fn build_method_response() -> [u8; 2] {
    [SOCKS5_VERSION, METHOD_NO_AUTH]
}

/// Parse the fixed request header.
pub fn parse_request_header(data: &[u8]) -> Result<RequestHeader> {
    if data.len() < REQUEST_HEADER_LEN {
        return Err(Error::request(format!(
            "request header too short: {} bytes",
            data.len()
        )));
    }

    Ok(RequestHeader {
        version: data[0],
        command: Command::from_u8(data[1]),
        atype: data[3],
    })
}

/// Parse a complete request: header, destination address and port.
pub fn parse_request(data: &[u8]) -> Result<HandshakeRequest> {
    let header = parse_request_header(data)?;
    let rest = &data[REQUEST_HEADER_LEN..];

    let (target, used) = match header.atype {
        ATYP_IPV4 => {
            if rest.len() < 6 {
                return Err(Error::request("IPv4 address truncated"));
            }
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            (TargetAddr::Ipv4(SocketAddrV4::new(ip, port)), 6)
        }
        ATYP_DOMAIN => {
            let Some(&len) = rest.first() else {
                return Err(Error::request("domain length missing"));
            };
            let len = len as usize;
            if rest.len() < 1 + len + 2 {
                return Err(Error::request("domain address truncated"));
            }
            let host = String::from_utf8_lossy(&rest[1..1 + len]).into_owned();
            let port = u16::from_be_bytes([rest[1 + len], rest[2 + len]]);
            (TargetAddr::Domain(host, port), 1 + len + 2)
        }
        other => return Err(Error::UnsupportedAddressType(other)),
    };

    if rest.len() > used {
        tracing::trace!("ignoring {} trailing request bytes", rest.len() - used);
    }

    Ok(HandshakeRequest {
        version: header.version,
        command: header.command,
        target,
    })
}

/// Serialize a reply.
///
/// `Reply::Succeeded` produces the 10-byte form carrying `bound` as an IPv4
/// address (unspecified if absent). Every other reply produces the 4-byte
/// form whose last byte is `atype`.
pub fn build_reply(reply: Reply, atype: u8, bound: Option<SocketAddrV4>) -> Bytes {
    match reply {
        Reply::Succeeded => {
            let bound = bound.unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
            let mut buf = BytesMut::with_capacity(SUCCESS_REPLY_LEN);
            buf.put_u8(SOCKS5_VERSION);
            buf.put_u8(Reply::Succeeded as u8);
            buf.put_u8(0x00);
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&bound.ip().octets());
            buf.put_u16(bound.port());
            buf.freeze()
        }
        code => {
            let mut buf = BytesMut::with_capacity(ERROR_REPLY_LEN);
            buf.put_u8(SOCKS5_VERSION);
            buf.put_u8(code as u8);
            buf.put_u8(0x00);
            buf.put_u8(atype);
            buf.freeze()
        }
    }
}
