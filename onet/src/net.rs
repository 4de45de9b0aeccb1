//! Conversion between operating system sockets and overlay connections.
//!
//! Socket addresses map onto `/ip/<ip>/tcp/<port>` and `/ip/<ip>/udp/<port>`.
//! [`TcpTransport`] is a ready to use native transport on top of these conversions; it is
//! not registered by default:
//!
//! ```no_run
//! use onet::{AnyTransport, net::TcpTransport, register_transport};
//!
//! register_transport(AnyTransport::native(TcpTransport)).unwrap();
//! ```

use std::{
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use onet_base::{Addr, ErrorKind, ParseError, Segment};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::{
    BoxConn, BoxListener, Config, Conn, Listener, NativeTransport, OverlayConn, OverlayNetwork,
    Transport, TransportError,
};

/// The transport protocol on top of IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum IpProtocol {
    /// TCP
    #[display("tcp")]
    Tcp,
    /// UDP
    #[display("udp")]
    Udp,
}

/// Converting between socket addresses and overlay addresses failed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConvertError {
    #[snafu(display("{addr} is not an ip socket address"))]
    Unsupported { addr: String },
    #[snafu(display("invalid segment"))]
    Segment { source: ParseError },
    #[snafu(transparent)]
    Io { source: io::Error },
}

impl ConvertError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::Unsupported { .. } => ErrorKind::InvalidParams,
            ConvertError::Segment { source, .. } => source.kind(),
            ConvertError::Io { .. } => ErrorKind::Transport,
        }
    }
}

/// Returns the overlay address of `socket_addr`.
pub fn socket_addr_to_addr(
    socket_addr: SocketAddr,
    protocol: IpProtocol,
) -> Result<Addr, ConvertError> {
    let ip = Segment::new("ip", socket_addr.ip().to_string()).context(SegmentSnafu)?;
    let port =
        Segment::new(&protocol.to_string(), socket_addr.port().to_string()).context(SegmentSnafu)?;
    Addr::from_segments([ip, port]).context(SegmentSnafu)
}

/// Returns the socket address encoded in `addr`.
///
/// Only addresses made of exactly an `ip` segment and a `tcp` or `udp` segment are
/// accepted.
pub fn addr_to_socket_addr(addr: &Addr) -> Result<(IpProtocol, SocketAddr), ConvertError> {
    let unsupported = || UnsupportedSnafu {
        addr: addr.to_string(),
    };
    let [ip, port] = addr.segments() else {
        return unsupported().fail();
    };
    if ip.protocol() != "ip" {
        return unsupported().fail();
    }
    let protocol = match port.protocol() {
        "tcp" => IpProtocol::Tcp,
        "udp" => IpProtocol::Udp,
        _ => return unsupported().fail(),
    };
    let ip: IpAddr = ip.value().parse().ok().context(unsupported())?;
    let port: u16 = port.value().parse().ok().context(unsupported())?;
    Ok((protocol, SocketAddr::new(ip, port)))
}

/// A TCP stream as a [`Conn`].
#[derive(Debug)]
pub struct TcpConn {
    stream: tokio::net::TcpStream,
    local_addr: Addr,
    remote_addr: Addr,
}

impl TcpConn {
    /// Wraps a connected stream.
    pub fn new(stream: tokio::net::TcpStream) -> Result<Self, ConvertError> {
        let local_addr = socket_addr_to_addr(stream.local_addr()?, IpProtocol::Tcp)?;
        let remote_addr = socket_addr_to_addr(stream.peer_addr()?, IpProtocol::Tcp)?;
        Ok(Self {
            stream,
            local_addr,
            remote_addr,
        })
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> tokio::net::TcpStream {
        self.stream
    }
}

impl Conn for TcpConn {
    fn local_addr(&self) -> Addr {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Addr {
        self.remote_addr.clone()
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// A bound TCP listener as a [`Listener`].
///
/// Pass it to [`OverlayNetwork::listen_with`] to serve a socket bound elsewhere.
#[derive(Debug)]
pub struct TcpListener {
    listener: tokio::net::TcpListener,
    local_addr: Addr,
}

impl TcpListener {
    /// Wraps a bound listener.
    pub fn new(listener: tokio::net::TcpListener) -> Result<Self, ConvertError> {
        let local_addr = socket_addr_to_addr(listener.local_addr()?, IpProtocol::Tcp)?;
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

impl Listener for TcpListener {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<BoxConn, TransportError>> {
        let (stream, remote) = ready!(self.listener.poll_accept(cx))?;
        trace!(%remote, "accepted tcp connection");
        stream.set_nodelay(true)?;
        let conn = TcpConn::new(stream).map_err(|err| TransportError::from_err("tcp", err))?;
        Poll::Ready(Ok(Box::new(conn)))
    }

    fn local_addr(&self) -> Addr {
        self.local_addr.clone()
    }
}

impl OverlayConn {
    /// Wraps a TCP stream connected outside of onet as a connection of `network`.
    ///
    /// No overlay is applied, the stream is expected to already carry the layers of
    /// `network`.
    pub fn from_tcp(
        stream: tokio::net::TcpStream,
        network: Arc<OverlayNetwork>,
    ) -> Result<Self, ConvertError> {
        Ok(OverlayConn::new(Box::new(TcpConn::new(stream)?), network))
    }
}

/// The native transport for `/ip/<ip>/tcp/<port>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    fn socket_addr(addr: &Addr) -> Result<SocketAddr, TransportError> {
        match addr_to_socket_addr(addr) {
            Ok((IpProtocol::Tcp, socket_addr)) => Ok(socket_addr),
            Ok((IpProtocol::Udp, _)) => Err(TransportError::from_err(
                "tcp",
                UnsupportedSnafu {
                    addr: addr.to_string(),
                }
                .build(),
            )),
            Err(err) => Err(TransportError::from_err("tcp", err)),
        }
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> &str {
        "tcp"
    }
}

impl NativeTransport for TcpTransport {
    fn listen(&self, addr: Addr, _config: Config) -> BoxFuture<Result<BoxListener, TransportError>> {
        Box::pin(async move {
            let socket_addr = Self::socket_addr(&addr)?;
            let listener = tokio::net::TcpListener::bind(socket_addr).await?;
            let listener =
                TcpListener::new(listener).map_err(|err| TransportError::from_err("tcp", err))?;
            Ok(Box::new(listener) as BoxListener)
        })
    }

    fn dial(&self, addr: Addr, _config: Config) -> BoxFuture<Result<BoxConn, TransportError>> {
        Box::pin(async move {
            let socket_addr = Self::socket_addr(&addr)?;
            let stream = tokio::net::TcpStream::connect(socket_addr).await?;
            stream.set_nodelay(true)?;
            let conn = TcpConn::new(stream).map_err(|err| TransportError::from_err("tcp", err))?;
            Ok(Box::new(conn) as BoxConn)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_socket_addr_conversion() {
        let v4 = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 8080);
        let addr = socket_addr_to_addr(v4, IpProtocol::Tcp).unwrap();
        assert_eq!(addr.to_string(), "/ip/127.0.0.1/tcp/8080");
        assert_eq!(addr_to_socket_addr(&addr).unwrap(), (IpProtocol::Tcp, v4));

        let v6 = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 53);
        let addr = socket_addr_to_addr(v6, IpProtocol::Udp).unwrap();
        assert_eq!(addr.to_string(), "/ip/::1/udp/53");
        assert_eq!(addr_to_socket_addr(&addr).unwrap(), (IpProtocol::Udp, v6));
    }

    #[test]
    fn test_unsupported_addrs() {
        for s in ["/ip/127.0.0.1", "/tcp/80/ip/127.0.0.1", "/ip/127.0.0.1/tcp/80/udp/81"] {
            let addr: Addr = s.parse().unwrap();
            let err = addr_to_socket_addr(&addr).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParams, "{s}");
        }
    }

    #[tokio::test]
    async fn test_tcp_transport_rejects_udp() {
        let addr: Addr = "/ip/127.0.0.1/udp/0".parse().unwrap();
        let err = TcpTransport.listen(addr, Config::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
