//! In-memory transports for tests.
//!
//! Nothing here touches the operating system: connections are [`tokio::io::duplex`]
//! pipes and listeners are channels registered in a per-transport table.

use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll, ready},
};

use n0_future::boxed::BoxFuture;
use onet_base::{Addr, Protocol, Segment, ValueError, register_protocols};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc,
};

use crate::{
    AnyTransport, BoxConn, BoxListener, Config, Conn, Listener, MuxError, MuxTransport,
    NativeTransport, OverlayNetwork, OverlayTransport, Transport, TransportError,
    register_transports,
};

const PIPE_CAPACITY: usize = 64 * 1024;

type Acceptors = Arc<Mutex<HashMap<Addr, mpsc::Sender<BoxConn>>>>;

/// One end of an in-memory pipe.
#[derive(Debug)]
pub struct MemoryConn {
    stream: DuplexStream,
    local_addr: Addr,
    remote_addr: Addr,
}

impl MemoryConn {
    /// Returns both ends of a new pipe between `a` and `b`.
    pub fn pair(a: Addr, b: Addr) -> (Self, Self) {
        let (left, right) = tokio::io::duplex(PIPE_CAPACITY);
        (
            Self {
                stream: left,
                local_addr: a.clone(),
                remote_addr: b.clone(),
            },
            Self {
                stream: right,
                local_addr: b,
                remote_addr: a,
            },
        )
    }
}

impl Conn for MemoryConn {
    fn local_addr(&self) -> Addr {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Addr {
        self.remote_addr.clone()
    }
}

impl AsyncRead for MemoryConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryConn {
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

/// A listener fed through a channel, unregistered on drop.
#[derive(Debug)]
pub struct MemoryListener {
    rx: mpsc::Receiver<BoxConn>,
    local_addr: Addr,
    acceptors: Acceptors,
}

impl MemoryListener {
    fn register(acceptors: &Acceptors, addr: Addr) -> Result<Self, TransportError> {
        let mut table = acceptors.lock().expect("poisoned");
        if table.contains_key(&addr) {
            return Err(TransportError::from_err(
                "memory",
                io::Error::new(io::ErrorKind::AddrInUse, addr.to_string()),
            ));
        }
        let (tx, rx) = mpsc::channel(16);
        table.insert(addr.clone(), tx);
        Ok(Self {
            rx,
            local_addr: addr,
            acceptors: acceptors.clone(),
        })
    }
}

impl Listener for MemoryListener {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<BoxConn, TransportError>> {
        match ready!(self.rx.poll_recv(cx)) {
            Some(conn) => Poll::Ready(Ok(conn)),
            None => Poll::Ready(Err(TransportError::closed())),
        }
    }

    fn local_addr(&self) -> Addr {
        self.local_addr.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.acceptors
            .lock()
            .expect("poisoned")
            .remove(&self.local_addr);
    }
}

async fn connect(acceptors: &Acceptors, addr: &Addr) -> Result<BoxConn, TransportError> {
    let tx = acceptors.lock().expect("poisoned").get(addr).cloned();
    let Some(tx) = tx else {
        return Err(io::Error::new(io::ErrorKind::ConnectionRefused, addr.to_string()).into());
    };
    let (client, server) = MemoryConn::pair(addr.clone(), addr.clone());
    tx.send(Box::new(server))
        .await
        .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
    Ok(Box::new(client))
}

/// A native transport connecting in-memory pipes.
///
/// Both ends of a connection use the dialed address as local and remote address.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    protocol: String,
    listeners: Acceptors,
    dials: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Creates a transport for `protocol`.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            listeners: Default::default(),
            dials: Default::default(),
        }
    }

    /// Returns the number of dials, successful or not.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }

    /// Returns whether a listener is open on `addr`.
    pub fn is_listening(&self, addr: &Addr) -> bool {
        self.listeners.lock().expect("poisoned").contains_key(addr)
    }
}

impl Transport for MemoryTransport {
    fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl NativeTransport for MemoryTransport {
    fn listen(&self, addr: Addr, _config: Config) -> BoxFuture<Result<BoxListener, TransportError>> {
        let listeners = self.listeners.clone();
        Box::pin(async move {
            let listener = MemoryListener::register(&listeners, addr)?;
            Ok(Box::new(listener) as BoxListener)
        })
    }

    fn dial(&self, addr: Addr, _config: Config) -> BoxFuture<Result<BoxConn, TransportError>> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let listeners = self.listeners.clone();
        Box::pin(async move { connect(&listeners, &addr).await })
    }
}

/// A connection wrapped by a [`TagTransport`].
///
/// It appends the transport's segment to the addresses of the wrapped connection.
#[derive(Debug)]
pub struct TagConn {
    inner: BoxConn,
    segment: Segment,
}

impl Conn for TagConn {
    fn local_addr(&self) -> Addr {
        self.inner.local_addr().join([self.segment.clone()])
    }

    fn remote_addr(&self) -> Addr {
        self.inner.remote_addr().join([self.segment.clone()])
    }
}

impl AsyncRead for TagConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TagConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// An overlay transport that passes bytes through unchanged.
///
/// It counts how often each side was applied, and can be made to fail every time.
#[derive(Debug, Clone)]
pub struct TagTransport {
    protocol: String,
    fail: bool,
    clients: Arc<AtomicUsize>,
    servers: Arc<AtomicUsize>,
}

impl TagTransport {
    /// Creates a pass-through transport for `protocol`.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            fail: false,
            clients: Default::default(),
            servers: Default::default(),
        }
    }

    /// Creates a transport for `protocol` that rejects every connection.
    pub fn failing(protocol: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(protocol)
        }
    }

    /// Returns how often the client side was applied.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Returns how often the server side was applied.
    pub fn server_count(&self) -> usize {
        self.servers.load(Ordering::Relaxed)
    }

    fn wrap(&self, conn: BoxConn, addr: Addr) -> BoxFuture<Result<BoxConn, TransportError>> {
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                return Err(TransportError::from_err(
                    "tag",
                    io::Error::new(io::ErrorKind::ConnectionAborted, "handshake rejected"),
                ));
            }
            let segment = addr.last().clone();
            Ok(Box::new(TagConn {
                inner: conn,
                segment,
            }) as BoxConn)
        })
    }
}

impl Transport for TagTransport {
    fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl OverlayTransport for TagTransport {
    fn client(
        &self,
        conn: BoxConn,
        addr: Addr,
        _config: Config,
    ) -> BoxFuture<Result<BoxConn, TransportError>> {
        self.clients.fetch_add(1, Ordering::Relaxed);
        self.wrap(conn, addr)
    }

    fn server(
        &self,
        conn: BoxConn,
        addr: Addr,
        _config: Config,
    ) -> BoxFuture<Result<BoxConn, TransportError>> {
        self.servers.fetch_add(1, Ordering::Relaxed);
        self.wrap(conn, addr)
    }
}

/// A mux transport with a fake session table.
///
/// Layering a client connection records a session to the connection's remote address.
/// [`open_stream`](MuxTransport::open_stream) succeeds when a session to the plan's
/// native address exists and a stream listener is open there; streams are fresh pipes
/// delivered to that listener.
#[derive(Debug, Clone)]
pub struct MemoryMux {
    tag: TagTransport,
    sessions: Arc<Mutex<HashSet<Addr>>>,
    acceptors: Acceptors,
    opened: Arc<AtomicUsize>,
}

impl MemoryMux {
    /// Creates a mux transport for `protocol`.
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            tag: TagTransport::new(protocol),
            sessions: Default::default(),
            acceptors: Default::default(),
            opened: Default::default(),
        }
    }

    /// Returns how often the client side was applied.
    pub fn client_count(&self) -> usize {
        self.tag.client_count()
    }

    /// Returns how often the server side was applied.
    pub fn server_count(&self) -> usize {
        self.tag.server_count()
    }

    /// Returns the number of streams opened over existing sessions.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Returns whether a stream listener is open for the native address `addr`.
    pub fn is_accepting(&self, addr: &Addr) -> bool {
        self.acceptors.lock().expect("poisoned").contains_key(addr)
    }

    /// Opens a stream to the listener at the native address `addr`, ignoring sessions.
    pub async fn open_raw(&self, addr: &Addr) -> Result<BoxConn, TransportError> {
        connect(&self.acceptors, addr).await
    }
}

impl Transport for MemoryMux {
    fn protocol(&self) -> &str {
        self.tag.protocol()
    }
}

impl OverlayTransport for MemoryMux {
    fn client(
        &self,
        conn: BoxConn,
        addr: Addr,
        config: Config,
    ) -> BoxFuture<Result<BoxConn, TransportError>> {
        self.sessions
            .lock()
            .expect("poisoned")
            .insert(conn.remote_addr());
        self.tag.client(conn, addr, config)
    }

    fn server(
        &self,
        conn: BoxConn,
        addr: Addr,
        config: Config,
    ) -> BoxFuture<Result<BoxConn, TransportError>> {
        self.tag.server(conn, addr, config)
    }
}

impl MuxTransport for MemoryMux {
    fn open_stream(
        &self,
        addr: Addr,
        network: Arc<OverlayNetwork>,
    ) -> BoxFuture<Result<BoxConn, MuxError>> {
        let target = network.native_addr().clone();
        let has_session = self.sessions.lock().expect("poisoned").contains(&target);
        let this = self.clone();
        Box::pin(async move {
            if !has_session || !this.is_accepting(&target) {
                return Err(MuxError::session_not_found());
            }
            this.opened.fetch_add(1, Ordering::Relaxed);
            let stream = connect(&this.acceptors, &target).await?;
            Ok(Box::new(TagConn {
                inner: stream,
                segment: addr.last().clone(),
            }) as BoxConn)
        })
    }

    fn accept_streams(
        &self,
        addr: Addr,
        network: Arc<OverlayNetwork>,
    ) -> BoxFuture<Result<BoxListener, TransportError>> {
        let acceptors = self.acceptors.clone();
        Box::pin(async move {
            let listener = MemoryListener::register(&acceptors, network.native_addr().clone())?;
            Ok(Box::new(MuxStreams {
                inner: listener,
                segment: addr.last().clone(),
            }) as BoxListener)
        })
    }
}

/// The stream listener of a [`MemoryMux`], tagging streams with the mux segment.
#[derive(Debug)]
struct MuxStreams {
    inner: MemoryListener,
    segment: Segment,
}

impl Listener for MuxStreams {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<BoxConn, TransportError>> {
        let conn = ready!(self.inner.poll_accept(cx))?;
        Poll::Ready(Ok(Box::new(TagConn {
            inner: conn,
            segment: self.segment.clone(),
        })))
    }

    fn local_addr(&self) -> Addr {
        self.inner.local_addr().join([self.segment.clone()])
    }
}

fn check_endpoint(value: &str) -> Result<(), ValueError> {
    if value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        Ok(())
    } else {
        Err(ValueError::custom(format!("invalid endpoint name {value:?}")))
    }
}

/// A set of in-memory transports registered under unique names.
///
/// For a prefix `p` it registers
///
/// - `p-mem`, a native [`MemoryTransport`] whose segment carries an endpoint name,
/// - `p-tls`, a [`TagTransport`],
/// - `p-mux`, a [`MemoryMux`],
/// - `p-fail`, a failing [`TagTransport`].
///
/// The registries are process wide, so every test needs its own prefix.
#[derive(Debug, Clone)]
pub struct MemoryStack {
    /// The native transport.
    pub native: MemoryTransport,
    /// The pass-through overlay.
    pub tls: TagTransport,
    /// The mux transport.
    pub mux: MemoryMux,
    /// The failing overlay.
    pub fail: TagTransport,
    names: [String; 4],
}

impl MemoryStack {
    /// Registers the protocols and transports for `prefix`.
    ///
    /// # Panics
    ///
    /// Panics if `prefix` was used before.
    pub fn register(prefix: &str) -> Self {
        let names = ["mem", "tls", "mux", "fail"].map(|suffix| format!("{prefix}-{suffix}"));
        register_protocols([
            Protocol::new(&names[0])
                .with_validator(check_endpoint)
                .with_native(true),
            Protocol::new(&names[1]),
            Protocol::new(&names[2]),
            Protocol::new(&names[3]),
        ])
        .expect("fresh prefix");

        let stack = Self {
            native: MemoryTransport::new(&names[0]),
            tls: TagTransport::new(&names[1]),
            mux: MemoryMux::new(&names[2]),
            fail: TagTransport::failing(&names[3]),
            names,
        };
        register_transports([
            AnyTransport::native(stack.native.clone()),
            AnyTransport::overlay(stack.tls.clone()),
            AnyTransport::mux(stack.mux.clone()),
            AnyTransport::overlay(stack.fail.clone()),
        ])
        .expect("fresh prefix");
        stack
    }

    /// Returns the native protocol name.
    pub fn mem_name(&self) -> &str {
        &self.names[0]
    }

    /// Returns the pass-through overlay's protocol name.
    pub fn tls_name(&self) -> &str {
        &self.names[1]
    }

    /// Returns the mux protocol name.
    pub fn mux_name(&self) -> &str {
        &self.names[2]
    }

    /// Returns the failing overlay's protocol name.
    pub fn fail_name(&self) -> &str {
        &self.names[3]
    }

    /// Returns the single segment address of the mux transport.
    pub fn mux_segment(&self) -> Addr {
        Addr::from(Segment::new(self.mux_name(), "").expect("registered"))
    }

    /// Returns `/<mem>/<endpoint>` followed by the value-less `layers`.
    pub fn addr(&self, endpoint: &str, layers: &[&str]) -> Addr {
        let mut s = format!("/{}/{endpoint}", self.mem_name());
        for layer in layers {
            s.push('/');
            s.push_str(layer);
        }
        s.parse().expect("valid test address")
    }
}
