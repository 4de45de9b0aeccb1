//! Connections and the dial engine.

use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use nested_enum_utils::common_fields;
use onet_base::{Addr, ErrorKind};
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep},
};
use tracing::{debug, instrument, trace};

use crate::{ConfigOption, MuxError, OverlayNetwork, ResolveError, TransportError, network::Side};

/// A bidirectional byte stream with overlay addresses.
///
/// Transports exchange connections as [`BoxConn`]s.  Dropping a connection closes it,
/// together with every connection it wraps.
pub trait Conn: AsyncRead + AsyncWrite + fmt::Debug + Send + Unpin + 'static {
    /// Returns the logical local address.
    fn local_addr(&self) -> Addr;

    /// Returns the logical remote address.
    fn remote_addr(&self) -> Addr;
}

/// A type-erased [`Conn`].
pub type BoxConn = Box<dyn Conn>;

impl Conn for Box<dyn Conn> {
    fn local_addr(&self) -> Addr {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> Addr {
        (**self).remote_addr()
    }
}

/// Dialing an address failed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum DialError {
    #[snafu(transparent)]
    Resolve { source: ResolveError },
    #[snafu(display("native transport {protocol} failed to dial"))]
    Native {
        protocol: String,
        source: TransportError,
    },
    #[snafu(display("mux transport {protocol} failed to open a stream"))]
    Mux {
        protocol: String,
        source: TransportError,
    },
    #[snafu(display("overlay transport {protocol} failed"))]
    Overlay {
        protocol: String,
        source: TransportError,
    },
}

impl DialError {
    /// Returns the protocol of the transport that failed, if a transport failed.
    pub fn protocol(&self) -> Option<&str> {
        match self {
            DialError::Resolve { .. } => None,
            DialError::Native { protocol, .. }
            | DialError::Mux { protocol, .. }
            | DialError::Overlay { protocol, .. } => Some(protocol),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DialError::Resolve { source, .. } => source.kind(),
            DialError::Native { source, .. }
            | DialError::Mux { source, .. }
            | DialError::Overlay { source, .. } => source.kind(),
        }
    }
}

/// A connection established through an [`OverlayNetwork`].
///
/// Reads and writes go through the outermost layer.  Deadlines apply to pending and
/// future operations until changed; an operation past its deadline fails with
/// [`io::ErrorKind::TimedOut`].
pub struct OverlayConn {
    inner: BoxConn,
    network: Arc<OverlayNetwork>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl OverlayConn {
    pub(crate) fn new(inner: BoxConn, network: Arc<OverlayNetwork>) -> Self {
        Self {
            inner,
            network,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Returns the network this connection was established through.
    pub fn network(&self) -> &Arc<OverlayNetwork> {
        &self.network
    }

    /// Sets both the read and the write deadline.
    ///
    /// `None` clears the deadlines.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Sets the read deadline, `None` clears it.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Sets the write deadline, `None` clears it.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Returns the outermost layer, dropping the deadlines.
    pub fn into_inner(self) -> BoxConn {
        self.inner
    }
}

fn check_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> io::Result<()> {
    if let Some(sleep) = deadline {
        if sleep.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"));
        }
    }
    Ok(())
}

impl fmt::Debug for OverlayConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayConn")
            .field("addr", self.network.addr())
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Conn for OverlayConn {
    fn local_addr(&self) -> Addr {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Addr {
        self.inner.remote_addr()
    }
}

impl AsyncRead for OverlayConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        check_deadline(&mut this.read_deadline, cx)?;
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for OverlayConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        check_deadline(&mut this.write_deadline, cx)?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        check_deadline(&mut this.write_deadline, cx)?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl OverlayNetwork {
    /// Establishes a connection following this plan.
    ///
    /// Every mux transport is asked for a stream over an existing session first, in plan
    /// order.  A stream from mux transport *k* only gets the overlays after *k* applied.
    /// If no mux transport has a session, the native transport dials and the whole overlay
    /// chain is applied on the client side.
    ///
    /// The dial is cancelled by dropping the future, e.g. through [`tokio::time::timeout`].
    #[instrument(skip_all, fields(addr = %self.addr))]
    pub async fn dial(self) -> Result<OverlayConn, DialError> {
        let network = Arc::new(self);
        network.config.metrics().dials.inc();
        let res = network.dial_inner().await;
        match res {
            Ok(conn) => Ok(OverlayConn::new(conn, network)),
            Err(err) => {
                debug!(protocol = ?err.protocol(), %err, "dial failed");
                network.config.metrics().dial_errors.inc();
                Err(err)
            }
        }
    }

    async fn dial_inner(self: &Arc<Self>) -> Result<BoxConn, DialError> {
        for (mux, addr, position) in self.muxes() {
            match mux.open_stream(addr.clone(), self.clone()).await {
                Ok(stream) => {
                    trace!(protocol = mux.protocol(), "reusing mux session");
                    self.config.metrics().dials_mux.inc();
                    return self
                        .apply_overlays(stream, position + 1, Side::Client)
                        .await
                        .map_err(|failure| {
                            dial_error::OverlaySnafu {
                                protocol: failure.protocol,
                            }
                            .into_error(failure.source)
                        });
                }
                Err(MuxError::SessionNotFound { .. }) => {
                    trace!(protocol = mux.protocol(), "no mux session");
                }
                Err(MuxError::Transport { source, .. }) => {
                    return Err(dial_error::MuxSnafu {
                        protocol: mux.protocol(),
                    }
                    .into_error(source));
                }
            }
        }

        let native = self.native_transport.protocol();
        trace!(protocol = native, addr = %self.native_addr, "dialing native transport");
        let conn = self
            .native_transport
            .dial(self.native_addr.clone(), self.config.clone())
            .await
            .context(dial_error::NativeSnafu { protocol: native })?;
        self.apply_overlays(conn, 0, Side::Client)
            .await
            .map_err(|failure| {
                dial_error::OverlaySnafu {
                    protocol: failure.protocol,
                }
                .into_error(failure.source)
            })
    }
}

/// Resolves `addr` and dials it.
pub async fn dial(
    addr: &Addr,
    options: impl IntoIterator<Item = ConfigOption>,
) -> Result<OverlayConn, DialError> {
    let network = OverlayNetwork::parse(addr, options)?;
    network.dial().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use n0_snafu::{Result, ResultExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::{MuxTransport, NativeTransport, test_utils::MemoryStack};

    #[tokio::test]
    #[traced_test]
    async fn test_dial_native_applies_full_chain() -> Result {
        let stack = MemoryStack::register("dial-full");
        let addr = stack.addr("srv", &[stack.mux_name(), stack.tls_name()]);
        let native_addr = stack.addr("srv", &[]);
        let mut raw = stack
            .native
            .listen(native_addr.clone(), Default::default())
            .await
            .e()?;

        let mut conn = dial(&addr, []).await.e()?;
        assert_eq!(stack.native.dial_count(), 1);
        assert_eq!(stack.mux.client_count(), 1);
        assert_eq!(stack.tls.client_count(), 1);
        assert_eq!(conn.local_addr(), addr);
        assert_eq!(conn.network().addr(), &addr);

        let mut server = crate::listener::accept_raw(&mut raw).await.e()?;
        conn.write_all(b"hello").await.e()?;
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.e()?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dial_mux_session_skips_inner_layers() -> Result {
        let stack = MemoryStack::register("dial-mux");
        let addr = stack.addr("srv", &[stack.mux_name(), stack.tls_name()]);
        let native_addr = stack.addr("srv", &[]);
        let _raw = stack
            .native
            .listen(native_addr.clone(), Default::default())
            .await
            .e()?;
        let network = OverlayNetwork::parse(&addr, []).e()?;
        let _streams = stack
            .mux
            .accept_streams(stack.mux_segment(), Arc::new(network))
            .await
            .e()?;

        // The first dial establishes the session.
        let _first = dial(&addr, []).await.e()?;
        assert_eq!(stack.native.dial_count(), 1);

        let second = dial(&addr, []).await.e()?;
        assert_eq!(stack.native.dial_count(), 1);
        assert_eq!(stack.mux.client_count(), 1);
        assert_eq!(stack.mux.opened_count(), 1);
        assert_eq!(stack.tls.client_count(), 2);
        assert_eq!(second.local_addr(), addr);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dial_falls_through_missing_sessions() -> Result {
        let stack = MemoryStack::register("dial-fallthrough");
        let addr = stack.addr("srv", &[stack.mux_name(), stack.tls_name()]);
        let _raw = stack
            .native
            .listen(stack.addr("srv", &[]), Default::default())
            .await
            .e()?;

        dial(&addr, []).await.e()?;
        dial(&addr, []).await.e()?;
        // Without a stream acceptor no session is ever reused.
        assert_eq!(stack.mux.opened_count(), 0);
        assert_eq!(stack.native.dial_count(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dial_rightmost_mux_without_session() -> Result {
        let stack = MemoryStack::register("dial-mux-last");
        let addr = stack.addr("srv", &[stack.mux_name()]);
        let _raw = stack
            .native
            .listen(stack.addr("srv", &[]), Default::default())
            .await
            .e()?;

        let conn = dial(&addr, []).await.e()?;
        assert_eq!(stack.native.dial_count(), 1);
        assert_eq!(stack.mux.client_count(), 1);
        assert_eq!(stack.mux.opened_count(), 0);
        assert_eq!(conn.local_addr(), addr);
        Ok(())
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    #[traced_test]
    async fn test_dial_records_to_config_metrics() -> Result {
        use crate::metrics::Metrics;

        let stack = MemoryStack::register("dial-metrics");
        let addr = stack.addr("srv", &[stack.tls_name()]);
        let _raw = stack
            .native
            .listen(stack.addr("srv", &[]), Default::default())
            .await
            .e()?;

        let metrics = Arc::new(Metrics::default());
        dial(&addr, [ConfigOption::metrics(metrics.clone())]).await.e()?;
        dial(&stack.addr("nobody", &[]), [ConfigOption::metrics(metrics.clone())])
            .await
            .unwrap_err();
        // Calls without the option record elsewhere.
        dial(&addr, []).await.e()?;

        assert_eq!(metrics.dials.get(), 2);
        assert_eq!(metrics.dial_errors.get(), 1);
        assert_eq!(metrics.dials_mux.get(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dial_overlay_failure_closes_conn() -> Result {
        let stack = MemoryStack::register("dial-fail");
        let addr = stack.addr("srv", &[stack.tls_name(), stack.fail_name()]);
        let mut raw = stack
            .native
            .listen(stack.addr("srv", &[]), Default::default())
            .await
            .e()?;

        let err = dial(&addr, []).await.unwrap_err();
        assert!(matches!(err, DialError::Overlay { .. }));
        assert_eq!(err.protocol(), Some(stack.fail_name()));
        assert_eq!(err.kind(), ErrorKind::Transport);

        // The partially layered client side has been dropped.
        let mut server = crate::listener::accept_raw(&mut raw).await.e()?;
        let mut buf = Vec::new();
        assert_eq!(server.read_to_end(&mut buf).await.e()?, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dial_native_failure() -> Result {
        let stack = MemoryStack::register("dial-refused");
        let err = dial(&stack.addr("nobody", &[stack.tls_name()]), [])
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Native { .. }));
        assert_eq!(err.protocol(), Some(stack.mem_name()));
        assert_eq!(stack.tls.client_count(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dial_resolve_failure() {
        let addr: Addr = "/ip/127.0.0.1/udp/1".parse().unwrap();
        let err = dial(&addr, []).await.unwrap_err();
        assert!(matches!(err, DialError::Resolve { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.protocol(), None);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_read_deadline() -> Result {
        let stack = MemoryStack::register("dial-deadline");
        let addr = stack.addr("srv", &[]);
        let mut raw = stack.native.listen(addr.clone(), Default::default()).await.e()?;
        let mut conn = dial(&addr, []).await.e()?;
        let mut server = crate::listener::accept_raw(&mut raw).await.e()?;

        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));
        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        // Still expired until cleared.
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        conn.set_read_deadline(None);
        server.write_all(b"ping").await.e()?;
        conn.read_exact(&mut buf).await.e()?;
        assert_eq!(&buf, b"ping");

        conn.set_write_deadline(Some(Instant::now() + Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        Ok(())
    }
}
