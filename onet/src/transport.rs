//! Transport roles and the global transport registry.
//!
//! A transport implements the segment of an [`Addr`] named by its [`Transport::protocol`].
//! Every transport plays exactly one of three roles:
//!
//! - a [`NativeTransport`] opens real connections and listeners, e.g. TCP or a reliable
//!   UDP protocol,
//! - an [`OverlayTransport`] wraps an existing connection into another one, e.g. TLS,
//! - a [`MuxTransport`] is an overlay that additionally carves streams out of the
//!   sessions it has established, so later dials to the same target can skip the native
//!   handshake entirely.
//!
//! The role is fixed when a transport is wrapped into an [`AnyTransport`] for
//! registration.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    sync::{Arc, LazyLock, RwLock},
};

use n0_future::boxed::BoxFuture;
use nested_enum_utils::common_fields;
use onet_base::{Addr, ErrorKind, RegisterError};
use snafu::{Backtrace, IntoError, Snafu};
use tracing::debug;

use crate::{BoxConn, BoxListener, Config, OverlayNetwork};

/// Errors reported by transport implementations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum TransportError {
    /// The listener was closed and will not yield further connections.
    #[snafu(display("listener closed"))]
    Closed {},
    #[snafu(transparent)]
    Io { source: std::io::Error },
    #[snafu(display("transport '{provenance}' error"))]
    User {
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl TransportError {
    /// Returns the error a [`Listener`] reports once it is closed.
    ///
    /// [`Listener`]: crate::Listener
    pub fn closed() -> Self {
        transport_error::ClosedSnafu.build()
    }

    /// Creates a new user error from an arbitrary error type.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(
        provenance: &'static str,
        source: T,
    ) -> Self {
        transport_error::UserSnafu { provenance }.into_error(Box::new(source))
    }

    /// Creates a new user error from an arbitrary boxed error type.
    pub fn from_err_box(
        provenance: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    ) -> Self {
        transport_error::UserSnafu { provenance }.into_error(source)
    }

    /// Returns whether this error signals a closed listener.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed { .. })
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Closed { .. } => ErrorKind::Closed,
            TransportError::Io { .. } | TransportError::User { .. } => ErrorKind::Transport,
        }
    }
}

/// Errors returned by [`MuxTransport::open_stream`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum MuxError {
    /// No existing session reaches the target; the dial may try other transports.
    #[snafu(display("mux session not found"))]
    SessionNotFound {},
    #[snafu(transparent)]
    Transport { source: TransportError },
}

impl MuxError {
    /// Returns the recoverable "no session" error.
    pub fn session_not_found() -> Self {
        mux_error::SessionNotFoundSnafu.build()
    }

    /// Returns whether the dial should fall through to the next candidate.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, MuxError::SessionNotFound { .. })
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MuxError::SessionNotFound { .. } => ErrorKind::MuxSessionNotFound,
            MuxError::Transport { source, .. } => source.kind(),
        }
    }
}

/// Common interface of all transports.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Returns the protocol name this transport implements.
    ///
    /// This is the registry key, it must match the protocol's name in addresses.
    fn protocol(&self) -> &str;
}

/// A transport that owns real sockets.
pub trait NativeTransport: Transport {
    /// Starts listening on `addr`, which ends with this transport's segment.
    fn listen(&self, addr: Addr, config: Config) -> BoxFuture<Result<BoxListener, TransportError>>;

    /// Connects to `addr`, which ends with this transport's segment.
    fn dial(&self, addr: Addr, config: Config) -> BoxFuture<Result<BoxConn, TransportError>>;
}

/// A transport that layers a new connection on top of an existing one.
///
/// `addr` is the single segment of this transport in the dialed or listened address.
/// Both methods take ownership of `conn`; on failure it must be dropped.
pub trait OverlayTransport: Transport {
    /// Performs the client side of the layer.
    fn client(
        &self,
        conn: BoxConn,
        addr: Addr,
        config: Config,
    ) -> BoxFuture<Result<BoxConn, TransportError>>;

    /// Performs the server side of the layer.
    fn server(
        &self,
        conn: BoxConn,
        addr: Addr,
        config: Config,
    ) -> BoxFuture<Result<BoxConn, TransportError>>;
}

/// An overlay transport multiplexing streams over its established sessions.
///
/// When dialing, the engine first asks every mux transport of the plan for a stream
/// and only falls back to a fresh native connection if all of them report
/// [`MuxError::SessionNotFound`].
pub trait MuxTransport: OverlayTransport {
    /// Opens a stream over an existing session to the target of `network`.
    ///
    /// `addr` is this transport's own segment.
    fn open_stream(
        &self,
        addr: Addr,
        network: Arc<OverlayNetwork>,
    ) -> BoxFuture<Result<BoxConn, MuxError>>;

    /// Returns a listener yielding streams opened by remote peers over sessions that
    /// terminate at the listening side of `network`.
    fn accept_streams(
        &self,
        addr: Addr,
        network: Arc<OverlayNetwork>,
    ) -> BoxFuture<Result<BoxListener, TransportError>>;
}

/// The role a transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Role {
    /// See [`NativeTransport`].
    #[display("native")]
    Native,
    /// See [`OverlayTransport`].
    #[display("overlay")]
    Overlay,
    /// See [`MuxTransport`].
    #[display("mux")]
    Mux,
}

/// A transport together with its role.
#[derive(Debug, Clone)]
pub enum AnyTransport {
    /// A native transport.
    Native(Arc<dyn NativeTransport>),
    /// An overlay transport.
    Overlay(Arc<dyn OverlayTransport>),
    /// A mux transport.
    Mux(Arc<dyn MuxTransport>),
}

impl AnyTransport {
    /// Wraps a native transport.
    pub fn native(transport: impl NativeTransport) -> Self {
        Self::Native(Arc::new(transport))
    }

    /// Wraps an overlay transport.
    pub fn overlay(transport: impl OverlayTransport) -> Self {
        Self::Overlay(Arc::new(transport))
    }

    /// Wraps a mux transport.
    pub fn mux(transport: impl MuxTransport) -> Self {
        Self::Mux(Arc::new(transport))
    }

    /// Returns the protocol name of the wrapped transport.
    pub fn protocol(&self) -> &str {
        match self {
            AnyTransport::Native(transport) => transport.protocol(),
            AnyTransport::Overlay(transport) => transport.protocol(),
            AnyTransport::Mux(transport) => transport.protocol(),
        }
    }

    /// Returns the role of the wrapped transport.
    pub fn role(&self) -> Role {
        match self {
            AnyTransport::Native(_) => Role::Native,
            AnyTransport::Overlay(_) => Role::Overlay,
            AnyTransport::Mux(_) => Role::Mux,
        }
    }
}

static TRANSPORTS: LazyLock<RwLock<BTreeMap<String, AnyTransport>>> =
    LazyLock::new(Default::default);

/// Registers a transport under its protocol name.
///
/// Fails if a transport with the same name exists; the existing registration is kept.
pub fn register_transport(transport: AnyTransport) -> Result<(), RegisterError> {
    let mut transports = TRANSPORTS.write().expect("poisoned");
    match transports.entry(transport.protocol().to_string()) {
        Entry::Occupied(entry) => Err(RegisterError::already_registered(
            "transport",
            entry.key().clone(),
        )),
        Entry::Vacant(entry) => {
            debug!(protocol = %entry.key(), role = %transport.role(), "registered transport");
            entry.insert(transport);
            Ok(())
        }
    }
}

/// Registers several transports, stopping at the first failure.
pub fn register_transports(
    transports: impl IntoIterator<Item = AnyTransport>,
) -> Result<(), RegisterError> {
    for transport in transports {
        register_transport(transport)?;
    }
    Ok(())
}

/// Looks up the transport registered for `protocol`.
pub fn lookup_transport(protocol: &str) -> Option<AnyTransport> {
    TRANSPORTS.read().expect("poisoned").get(protocol).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryMux, MemoryTransport, TagTransport};

    #[test]
    fn test_register_duplicate_keeps_original() {
        register_transport(AnyTransport::native(MemoryTransport::new("tr-dup"))).unwrap();

        let err = register_transport(AnyTransport::overlay(TagTransport::new("tr-dup")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);
        assert_eq!(err.to_string(), "transport tr-dup already registered");

        let original = lookup_transport("tr-dup").unwrap();
        assert_eq!(original.role(), Role::Native);
    }

    #[test]
    fn test_register_transports_roles() {
        register_transports([
            AnyTransport::overlay(TagTransport::new("tr-roles-tls")),
            AnyTransport::mux(MemoryMux::new("tr-roles-mux")),
        ])
        .unwrap();

        assert_eq!(lookup_transport("tr-roles-tls").unwrap().role(), Role::Overlay);
        let mux = lookup_transport("tr-roles-mux").unwrap();
        assert_eq!(mux.role(), Role::Mux);
        assert_eq!(mux.protocol(), "tr-roles-mux");
        assert!(lookup_transport("tr-roles-missing").is_none());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(TransportError::closed().kind(), ErrorKind::Closed);
        assert!(TransportError::closed().is_closed());

        let io = TransportError::from(std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::Transport);

        let user = TransportError::from_err("kcp", std::io::Error::other("boom"));
        assert_eq!(user.to_string(), "transport 'kcp' error");

        assert_eq!(
            MuxError::session_not_found().kind(),
            ErrorKind::MuxSessionNotFound
        );
        let mux = MuxError::from(TransportError::closed());
        assert!(!mux.is_session_not_found());
        assert_eq!(mux.kind(), ErrorKind::Closed);
    }
}
