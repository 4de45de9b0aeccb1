//! Listeners and the listen engine.
//!
//! An [`OverlayListener`] serves connections from several underlying listeners at once:
//! the native transport's listener, plus one stream listener per mux transport of the
//! plan.  Each underlying listener is driven by its own task, and all of them feed one
//! bounded queue that [`OverlayListener::accept`] reads from.

use std::{
    fmt,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use n0_future::task::JoinSet;
use nested_enum_utils::common_fields;
use onet_base::{Addr, ErrorKind};
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, instrument, trace, warn};

use crate::{
    BoxConn, ConfigOption, OverlayConn, OverlayNetwork, ResolveError, TransportError,
    network::Side,
};

/// Number of accepted connections buffered until [`OverlayListener::accept`] is called.
const ACCEPT_QUEUE: usize = 16;

/// A source of incoming [`Conn`]s.
///
/// Once closed, `poll_accept` must report [`TransportError::closed`].  Dropping the
/// listener releases its resources.
///
/// [`Conn`]: crate::Conn
pub trait Listener: fmt::Debug + Send + 'static {
    /// Polls for the next incoming connection.
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<BoxConn, TransportError>>;

    /// Returns the logical address the listener is bound to.
    fn local_addr(&self) -> Addr;
}

/// A type-erased [`Listener`].
pub type BoxListener = Box<dyn Listener>;

impl Listener for Box<dyn Listener> {
    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<Result<BoxConn, TransportError>> {
        (**self).poll_accept(cx)
    }

    fn local_addr(&self) -> Addr {
        (**self).local_addr()
    }
}

/// Waits for the next connection of `listener`.
pub(crate) async fn accept_raw<L: Listener + ?Sized>(
    listener: &mut L,
) -> Result<BoxConn, TransportError> {
    std::future::poll_fn(|cx| listener.poll_accept(cx)).await
}

/// Starting to listen failed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum ListenError {
    #[snafu(transparent)]
    Resolve { source: ResolveError },
    #[snafu(display("native transport {protocol} failed to listen"))]
    Native {
        protocol: String,
        source: TransportError,
    },
    #[snafu(display("mux transport {protocol} failed to listen"))]
    Mux {
        protocol: String,
        source: TransportError,
    },
}

impl ListenError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ListenError::Resolve { source, .. } => source.kind(),
            ListenError::Native { source, .. } | ListenError::Mux { source, .. } => source.kind(),
        }
    }
}

/// Accepting a connection failed.
///
/// Apart from [`AcceptError::Closed`], errors concern a single connection; the listener
/// keeps serving.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum AcceptError {
    #[snafu(display("listener closed"))]
    Closed {},
    #[snafu(display("transport {protocol} failed to accept"))]
    Accept {
        protocol: String,
        source: TransportError,
    },
    #[snafu(display("overlay transport {protocol} failed"))]
    Overlay {
        protocol: String,
        source: TransportError,
    },
}

impl AcceptError {
    /// Returns whether the listener is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, AcceptError::Closed { .. })
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcceptError::Closed { .. } => ErrorKind::Closed,
            AcceptError::Accept { source, .. } | AcceptError::Overlay { source, .. } => {
                source.kind()
            }
        }
    }
}

type Accepted = Result<OverlayConn, AcceptError>;

/// A listener serving an [`OverlayNetwork`].
///
/// Dropping the listener stops serving, but only [`close`](Self::close) waits until all
/// underlying listeners are released.
#[derive(Debug)]
pub struct OverlayListener {
    local_addr: Addr,
    network: Arc<OverlayNetwork>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
    cancel: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl OverlayListener {
    /// Waits for the next connection.
    ///
    /// Connections arrive fully layered, in the order their handshakes finish.
    ///
    /// Returns [`AcceptError::Closed`] once the listener is closed, including for calls
    /// pending while it gets closed.
    pub async fn accept(&self) -> Result<OverlayConn, AcceptError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => accept_error::ClosedSnafu.fail(),
            accepted = async { self.incoming.lock().await.recv().await } => {
                accepted.unwrap_or_else(|| accept_error::ClosedSnafu.fail())
            }
        }
    }

    /// Closes the listener.
    ///
    /// Returns once every underlying listener has been dropped.  Connections queued but not
    /// yet accepted are dropped as well.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks = self.tasks.lock().expect("poisoned").take();
        if let Some(mut tasks) = tasks {
            while let Some(res) = tasks.join_next().await {
                if let Err(err) = res {
                    if err.is_panic() {
                        error!("accept task panicked: {err:?}");
                    }
                }
            }
        }
        let mut incoming = self.incoming.lock().await;
        incoming.close();
        while incoming.try_recv().is_ok() {}
        debug!(local_addr = %self.local_addr, "listener closed");
    }

    /// Returns whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the native listener's address followed by every overlay segment.
    pub fn local_addr(&self) -> &Addr {
        &self.local_addr
    }

    /// Returns the network this listener serves.
    pub fn network(&self) -> &Arc<OverlayNetwork> {
        &self.network
    }
}

impl Drop for OverlayListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drives one underlying listener.
///
/// Every accepted connection gets its own task for the server side of the overlay chain,
/// so a peer stalling in a handshake holds up nobody else.
#[derive(Debug)]
struct AcceptWorker {
    protocol: String,
    listener: BoxListener,
    /// Overlays from this chain index on are applied to accepted connections.
    start: usize,
    network: Arc<OverlayNetwork>,
    tx: mpsc::Sender<Accepted>,
    cancel: CancellationToken,
}

impl AcceptWorker {
    async fn run(mut self) {
        let mut handshakes = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(res) = handshakes.join_next() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            error!("handshake task panicked: {err:?}");
                        }
                    }
                    continue;
                }
                accepted = accept_raw(&mut self.listener) => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let remote_addr = conn.remote_addr();
                    trace!(%remote_addr, "accepted connection");
                    let token = self.cancel.child_token();
                    let fut = handshake(self.network.clone(), conn, self.start, self.tx.clone());
                    handshakes.spawn(
                        async move { token.run_until_cancelled(fut).await }
                            .instrument(debug_span!("handshake", %remote_addr)),
                    );
                }
                Err(err) if err.is_closed() => {
                    debug!("underlying listener closed");
                    break;
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    self.network.config.metrics().accept_errors.inc();
                    let item = Err(accept_error::AcceptSnafu {
                        protocol: self.protocol.clone(),
                    }
                    .into_error(err));
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        sent = self.tx.send(item) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        handshakes.shutdown().await;
        trace!("accept loop finished");
    }
}

/// Applies the server side of the overlay chain from `start` on and queues the result.
async fn handshake(
    network: Arc<OverlayNetwork>,
    conn: BoxConn,
    start: usize,
    tx: mpsc::Sender<Accepted>,
) {
    let metrics = network.config.metrics().clone();
    let layered = network.apply_overlays(conn, start, Side::Server).await;
    let item = match layered {
        Ok(conn) => {
            metrics.accepted.inc();
            Ok(OverlayConn::new(conn, network))
        }
        Err(failure) => {
            warn!(protocol = %failure.protocol, "overlay failed: {}", failure.source);
            metrics.accept_errors.inc();
            Err(accept_error::OverlaySnafu {
                protocol: failure.protocol,
            }
            .into_error(failure.source))
        }
    };
    if tx.send(item).await.is_err() {
        trace!("listener gone, dropping connection");
    }
}

impl OverlayNetwork {
    /// Starts serving this plan.
    ///
    /// The native transport listens on the native address, and every mux transport starts
    /// accepting streams.  If any of them fails, everything opened so far is closed again.
    #[instrument(skip_all, fields(addr = %self.addr))]
    pub async fn listen(self) -> Result<OverlayListener, ListenError> {
        let native = self
            .native_transport
            .listen(self.native_addr.clone(), self.config.clone())
            .await
            .context(listen_error::NativeSnafu {
                protocol: self.native_transport.protocol(),
            })?;
        self.listen_with(native).await
    }

    /// Starts serving this plan with an already bound native listener.
    ///
    /// This is how sockets created outside of onet are served, see
    /// [`TcpListener`](crate::net::TcpListener).
    #[instrument(skip_all, fields(addr = %self.addr))]
    pub async fn listen_with(self, native: BoxListener) -> Result<OverlayListener, ListenError> {
        let network = Arc::new(self);
        let local_addr = native.local_addr().join(
            network
                .overlay_addrs
                .iter()
                .flat_map(|addr| addr.segments().iter().cloned()),
        );
        debug!(%local_addr, "native listener bound");

        let mut sources = vec![(network.native_transport.protocol().to_string(), native, 0)];
        for (mux, addr, position) in network.muxes() {
            // On failure `sources` is dropped, which closes the listeners opened so far.
            let listener = mux
                .accept_streams(addr.clone(), network.clone())
                .await
                .context(listen_error::MuxSnafu {
                    protocol: mux.protocol(),
                })?;
            sources.push((mux.protocol().to_string(), listener, position + 1));
        }

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for (protocol, listener, start) in sources {
            let span = debug_span!("accept", %protocol);
            let worker = AcceptWorker {
                protocol,
                listener,
                start,
                network: network.clone(),
                tx: tx.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(worker.run().instrument(span));
        }
        network.config.metrics().listeners.inc();

        Ok(OverlayListener {
            local_addr,
            network,
            incoming: tokio::sync::Mutex::new(rx),
            cancel,
            tasks: Mutex::new(Some(tasks)),
        })
    }
}

/// Resolves `addr` and listens on it.
pub async fn listen(
    addr: &Addr,
    options: impl IntoIterator<Item = ConfigOption>,
) -> Result<OverlayListener, ListenError> {
    let network = OverlayNetwork::parse(addr, options)?;
    network.listen().await
}
