//! Overlay network transports composed from self-describing addresses.
//!
//! An overlay address such as `/ip/1.2.3.4/udp/1812/kcp/tls/mux` describes a stack of
//! transports: here a `kcp` connection over UDP, secured with `tls`, multiplexed with
//! `mux`.  onet looks up the transport registered for every segment, splits the address
//! into the native part that opens real sockets and the overlay chain applied on top of
//! it, and drives that chain to produce a single connection or listener.
//!
//! ```no_run
//! # async fn wrapper() -> n0_snafu::Result<()> {
//! use onet::{Addr, AnyTransport, net::TcpTransport, register_transport};
//! use tokio::io::AsyncWriteExt;
//!
//! register_transport(AnyTransport::native(TcpTransport))?;
//!
//! let addr: Addr = "/ip/127.0.0.1/tcp/4433".parse()?;
//! let listener = onet::listen(&addr, []).await?;
//! tokio::spawn(async move {
//!     while let Ok(mut conn) = listener.accept().await {
//!         conn.write_all(b"hello").await.ok();
//!     }
//! });
//!
//! let conn = onet::dial(&addr, []).await?;
//! # drop(conn);
//! # Ok(())
//! # }
//! ```
//!
//! Transports plug in through the [`NativeTransport`], [`OverlayTransport`] and
//! [`MuxTransport`] traits.  Segment names must be registered as [`Protocol`]s before an
//! address using them can be parsed.
#![cfg_attr(onet_docsrs, feature(doc_auto_cfg))]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod conn;
pub mod listener;
pub mod metrics;
pub mod net;
pub mod network;
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(onet_docsrs, doc(cfg(any(test, feature = "test-utils"))))]
pub mod test_utils;
pub mod transport;

pub use onet_base::{
    Addr, ErrorKind, ParseError, Protocol, RegisterError, Segment, Validator, ValueError,
    lookup_protocol, register_protocol, register_protocols,
};

pub use self::{
    config::{Config, ConfigError, ConfigOption},
    conn::{BoxConn, Conn, DialError, OverlayConn, dial},
    listener::{AcceptError, BoxListener, ListenError, Listener, OverlayListener, listen},
    network::{OverlayNetwork, ResolveError},
    transport::{
        AnyTransport, MuxError, MuxTransport, NativeTransport, OverlayTransport, Role,
        Transport, TransportError, lookup_transport, register_transport, register_transports,
    },
};
