//! Resolving an address into a connection plan.

use std::sync::Arc;

use nested_enum_utils::common_fields;
use onet_base::{Addr, ErrorKind};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, trace};

use crate::{
    BoxConn, Config, ConfigError, ConfigOption, TransportError,
    transport::{AnyTransport, MuxTransport, NativeTransport, OverlayTransport, lookup_transport},
};

/// Resolving an address failed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ResolveError {
    #[snafu(display("failed to apply config option"))]
    Config { source: ConfigError },
    #[snafu(display("transport support protocol {protocol} not found"))]
    TransportNotFound { protocol: String },
    #[snafu(display("expect native transport"))]
    NoNativeTransport {},
}

impl ResolveError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::Config { source, .. } => source.kind(),
            ResolveError::TransportNotFound { .. } | ResolveError::NoNativeTransport { .. } => {
                ErrorKind::NotFound
            }
        }
    }
}

/// The resolved plan for reaching or serving one address.
///
/// An address like `/ip/1.2.3.4/udp/1812/kcp/tls/mux` resolves to the native transport
/// `kcp` reached at `/ip/1.2.3.4/udp/1812/kcp`, followed by the overlay chain
/// `[tls, mux]`, of which `mux` is also a mux transport.
///
/// A plan is built for a single [`dial`](Self::dial) or [`listen`](Self::listen) and
/// consumed by it.
#[derive(Debug)]
pub struct OverlayNetwork {
    pub(crate) addr: Addr,
    pub(crate) native_addr: Addr,
    pub(crate) native_transport: Arc<dyn NativeTransport>,
    pub(crate) mux_addrs: Vec<Addr>,
    pub(crate) mux_transports: Vec<Arc<dyn MuxTransport>>,
    /// Index of each mux transport within `overlay_transports`.
    pub(crate) mux_positions: Vec<usize>,
    pub(crate) overlay_addrs: Vec<Addr>,
    pub(crate) overlay_transports: Vec<Arc<dyn OverlayTransport>>,
    pub(crate) config: Config,
}

/// The side of a connection an overlay chain is applied for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// An overlay transport rejected a connection.
#[derive(Debug)]
pub(crate) struct LayerFailure {
    pub(crate) protocol: String,
    pub(crate) source: TransportError,
}

impl OverlayNetwork {
    /// Resolves `addr` into a plan, applying `options` to a fresh [`Config`] first.
    ///
    /// The segments are walked from the right.  Mux and overlay transports are collected
    /// until the first native transport, which ends the walk; everything left of it is the
    /// native address.
    pub fn parse(
        addr: &Addr,
        options: impl IntoIterator<Item = ConfigOption>,
    ) -> Result<Self, ResolveError> {
        let config = Config::from_options(options).context(ConfigSnafu)?;

        let mut mux_addrs = Vec::new();
        let mut mux_transports = Vec::new();
        let mut mux_positions = Vec::new();
        let mut overlay_addrs = Vec::new();
        let mut overlay_transports: Vec<Arc<dyn OverlayTransport>> = Vec::new();

        for (index, segment) in addr.segments().iter().enumerate().rev() {
            let transport =
                lookup_transport(segment.protocol()).context(TransportNotFoundSnafu {
                    protocol: segment.protocol(),
                })?;
            trace!(protocol = segment.protocol(), role = %transport.role(), "resolved segment");
            match transport {
                AnyTransport::Mux(mux) => {
                    mux_positions.push(overlay_transports.len());
                    mux_addrs.push(Addr::from(segment.clone()));
                    mux_transports.push(mux.clone());
                    let overlay: Arc<dyn OverlayTransport> = mux;
                    overlay_transports.push(overlay);
                    overlay_addrs.push(Addr::from(segment.clone()));
                }
                AnyTransport::Overlay(overlay) => {
                    overlay_transports.push(overlay);
                    overlay_addrs.push(Addr::from(segment.clone()));
                }
                AnyTransport::Native(native_transport) => {
                    // Collected right to left, the plan is ordered native-adjacent first.
                    let count = overlay_transports.len();
                    mux_addrs.reverse();
                    mux_transports.reverse();
                    overlay_addrs.reverse();
                    overlay_transports.reverse();
                    let mux_positions = mux_positions
                        .into_iter()
                        .rev()
                        .map(|position| count - 1 - position)
                        .collect();

                    let network = Self {
                        addr: addr.clone(),
                        native_addr: addr.up_to(index),
                        native_transport,
                        mux_addrs,
                        mux_transports,
                        mux_positions,
                        overlay_addrs,
                        overlay_transports,
                        config,
                    };
                    debug!(
                        addr = %network.addr,
                        native = network.native_transport.protocol(),
                        overlays = network.overlay_transports.len(),
                        muxes = network.mux_transports.len(),
                        "resolved overlay network"
                    );
                    return Ok(network);
                }
            }
        }

        NoNativeTransportSnafu.fail()
    }

    /// Returns the address this plan was resolved from.
    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    /// Returns the prefix of the address handled by the native transport.
    pub fn native_addr(&self) -> &Addr {
        &self.native_addr
    }

    /// Returns the native transport.
    pub fn native_transport(&self) -> &Arc<dyn NativeTransport> {
        &self.native_transport
    }

    /// Returns the segments of the mux transports, native-adjacent first.
    pub fn mux_addrs(&self) -> &[Addr] {
        &self.mux_addrs
    }

    /// Returns the mux transports, native-adjacent first.
    pub fn mux_transports(&self) -> &[Arc<dyn MuxTransport>] {
        &self.mux_transports
    }

    /// Returns the segments of the overlay chain, native-adjacent first.
    pub fn overlay_addrs(&self) -> &[Addr] {
        &self.overlay_addrs
    }

    /// Returns the overlay chain, native-adjacent first.
    ///
    /// Mux transports are part of the chain.
    pub fn overlay_transports(&self) -> &[Arc<dyn OverlayTransport>] {
        &self.overlay_transports
    }

    /// Returns the config built from the options.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Iterates over the mux transports with their segment and chain position.
    pub(crate) fn muxes(&self) -> impl Iterator<Item = (&Arc<dyn MuxTransport>, &Addr, usize)> {
        self.mux_transports
            .iter()
            .zip(&self.mux_addrs)
            .zip(&self.mux_positions)
            .map(|((mux, addr), position)| (mux, addr, *position))
    }

    /// Applies the overlay chain to `conn`, starting at chain index `start`.
    ///
    /// On failure `conn`, including every layer built so far, has been dropped.
    pub(crate) async fn apply_overlays(
        &self,
        mut conn: BoxConn,
        start: usize,
        side: Side,
    ) -> Result<BoxConn, LayerFailure> {
        let layers = self.overlay_transports.iter().zip(&self.overlay_addrs);
        for (transport, addr) in layers.skip(start) {
            trace!(protocol = transport.protocol(), ?side, "applying overlay");
            let layered = match side {
                Side::Client => transport.client(conn, addr.clone(), self.config.clone()),
                Side::Server => transport.server(conn, addr.clone(), self.config.clone()),
            };
            conn = layered.await.map_err(|source| LayerFailure {
                protocol: transport.protocol().to_string(),
                source,
            })?;
        }
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use onet_base::{Protocol, Segment, register_protocols};

    use super::*;
    use crate::{
        register_transports,
        test_utils::{MemoryMux, MemoryStack, MemoryTransport, TagTransport},
    };

    fn protocols(transports: &[Arc<dyn OverlayTransport>]) -> Vec<&str> {
        transports.iter().map(|t| t.protocol()).collect()
    }

    #[test]
    fn test_parse_kcp_tls_mux() {
        register_protocols([
            Protocol::new("kcp").with_native(true),
            Protocol::new("tls"),
            Protocol::new("mux"),
        ])
        .unwrap();
        register_transports([
            AnyTransport::native(MemoryTransport::new("kcp")),
            AnyTransport::overlay(TagTransport::new("tls")),
            AnyTransport::mux(MemoryMux::new("mux")),
        ])
        .unwrap();

        let addr: Addr = "/ip/127.0.0.1/udp/1812/kcp/tls/mux".parse().unwrap();
        let network = OverlayNetwork::parse(&addr, []).unwrap();

        assert_eq!(network.addr(), &addr);
        assert_eq!(network.native_addr().to_string(), "/ip/127.0.0.1/udp/1812/kcp");
        assert_eq!(network.native_transport().protocol(), "kcp");
        assert_eq!(protocols(network.overlay_transports()), ["tls", "mux"]);
        let overlay_addrs: Vec<_> = network.overlay_addrs().iter().map(Addr::to_string).collect();
        assert_eq!(overlay_addrs, ["/tls", "/mux"]);
        assert_eq!(network.mux_transports().len(), 1);
        assert_eq!(network.mux_transports()[0].protocol(), "mux");
        assert_eq!(network.mux_addrs()[0].to_string(), "/mux");
        assert_eq!(network.mux_positions, [1]);
    }

    #[test]
    fn test_parse_native_only() {
        let stack = MemoryStack::register("net-native");
        let network = OverlayNetwork::parse(&stack.addr("a", &[]), []).unwrap();

        assert_eq!(network.native_addr(), network.addr());
        assert!(network.overlay_transports().is_empty());
        assert!(network.mux_transports().is_empty());
    }

    #[test]
    fn test_parse_several_muxes() {
        let stack = MemoryStack::register("net-several");
        let second = MemoryMux::new("net-several-mux2");
        register_protocols([Protocol::new("net-several-mux2")]).unwrap();
        register_transports([AnyTransport::mux(second)]).unwrap();

        let addr = stack
            .addr("a", &[stack.mux_name(), stack.tls_name()])
            .join([Segment::new("net-several-mux2", "").unwrap()]);
        let network = OverlayNetwork::parse(&addr, []).unwrap();

        let overlays = protocols(network.overlay_transports());
        assert_eq!(
            overlays,
            ["net-several-mux", "net-several-tls", "net-several-mux2"]
        );
        let muxes: Vec<_> = network.mux_transports().iter().map(|m| m.protocol()).collect();
        assert_eq!(muxes, ["net-several-mux", "net-several-mux2"]);
        assert_eq!(network.mux_positions, [0, 2]);
    }

    #[test]
    fn test_parse_innermost_native_wins() {
        // Everything left of the rightmost native segment is its address.
        let stack = MemoryStack::register("net-inner");
        let addr = stack
            .addr("a", &[stack.tls_name()])
            .join(stack.addr("b", &[]).segments().iter().cloned());
        let network = OverlayNetwork::parse(&addr, []).unwrap();

        assert_eq!(network.native_addr(), network.addr());
        assert!(network.overlay_transports().is_empty());
    }

    #[test]
    fn test_parse_no_native() {
        let stack = MemoryStack::register("net-nonative");
        let addr: Addr = format!("/{}/{}", stack.tls_name(), stack.mux_name())
            .parse()
            .unwrap();

        let err = OverlayNetwork::parse(&addr, []).unwrap_err();
        assert!(matches!(err, ResolveError::NoNativeTransport { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_parse_missing_transport() {
        // `udp` is a known protocol, but nothing implements it.
        let addr: Addr = "/ip/127.0.0.1/udp/1812".parse().unwrap();
        let err = OverlayNetwork::parse(&addr, []).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "transport support protocol udp not found");
    }

    #[test]
    fn test_parse_failing_option() {
        let stack = MemoryStack::register("net-option");
        let options = [
            ConfigOption::bind("net-option.key", 1u8),
            ConfigOption::bind("net-option.key", 2u8),
        ];
        let err = OverlayNetwork::parse(&stack.addr("a", &[]), options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);

        let network =
            OverlayNetwork::parse(&stack.addr("a", &[]), [ConfigOption::bind("k", 7u8)]).unwrap();
        assert_eq!(*network.config().get::<u8>("k").unwrap(), 7);
    }
}
