//! Self-describing overlay addresses.
//!
//! An [`Addr`] is an ordered list of [`Segment`]s written as `/name/value/name/...`, e.g.
//! `/ip/127.0.0.1/udp/1812/kcp/tls/mux`.  Whether a segment consumes a value token is
//! decided by its registered [`Protocol`], so an address can only be parsed after all of
//! its protocols are registered.
//!
//! [`Protocol`]: crate::Protocol

use std::{
    fmt,
    hash::{Hash, Hasher},
    iter,
    str::FromStr,
    sync::Arc,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu, ensure};

use crate::{ErrorKind, ValueError, lookup_protocol};

/// Can occur when parsing a string into an [`Addr`] or creating a [`Segment`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseError {
    #[snafu(display("address has no segments"))]
    Empty {},
    #[snafu(display("protocol {name} not found"))]
    UnknownProtocol { name: String },
    #[snafu(display("protocol {protocol} requires a value"))]
    MissingValue { protocol: String },
    #[snafu(display("protocol {protocol} takes no value"))]
    UnexpectedValue { protocol: String },
    #[snafu(display("protocol {protocol} value check error"))]
    InvalidValue {
        protocol: String,
        source: ValueError,
    },
}

impl ParseError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParseError::Empty { .. }
            | ParseError::MissingValue { .. }
            | ParseError::UnexpectedValue { .. } => ErrorKind::InvalidParams,
            ParseError::UnknownProtocol { .. } => ErrorKind::NotFound,
            ParseError::InvalidValue { .. } => ErrorKind::ProtocolValueError,
        }
    }
}

/// One `name[/value]` unit of an [`Addr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    protocol: String,
    value: String,
    native: bool,
}

impl Segment {
    /// Creates a segment of a registered protocol.
    ///
    /// `value` must be empty for protocols without a validator and must pass the validator
    /// otherwise.
    pub fn new(protocol: &str, value: impl Into<String>) -> Result<Self, ParseError> {
        let registered =
            lookup_protocol(protocol).context(UnknownProtocolSnafu { name: protocol })?;
        let value = value.into();
        if registered.has_value() {
            ensure!(!value.is_empty(), MissingValueSnafu { protocol });
            registered
                .validate(&value)
                .context(InvalidValueSnafu { protocol })?;
        } else {
            ensure!(value.is_empty(), UnexpectedValueSnafu { protocol });
        }
        Ok(Self {
            protocol: protocol.to_string(),
            value,
            native: registered.is_native(),
        })
    }

    /// Returns the protocol name.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns the value token, empty for value-less protocols.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns whether the protocol was registered as native when this segment was created.
    pub fn is_native(&self) -> bool {
        self.native
    }

    fn tokens(&self) -> impl Iterator<Item = &str> {
        let value = (!self.value.is_empty()).then_some(self.value.as_str());
        iter::once(self.protocol.as_str()).chain(value)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in self.tokens() {
            write!(f, "/{token}")?;
        }
        Ok(())
    }
}

/// An overlay network address.
///
/// It is cheaply clonable, the segments are shared behind an `Arc` and never mutated;
/// [`Addr::join`] always creates a new address.
///
/// Two addresses are equal iff their string forms are equal.
#[derive(Clone)]
pub struct Addr(Arc<[Segment]>);

impl Addr {
    /// Creates an address from segments.
    ///
    /// Fails if `segments` is empty.
    pub fn from_segments(
        segments: impl IntoIterator<Item = Segment>,
    ) -> Result<Self, ParseError> {
        let segments: Arc<[Segment]> = segments.into_iter().collect();
        ensure!(!segments.is_empty(), EmptySnafu);
        Ok(Self(segments))
    }

    /// Parses the quoted form produced by [`Addr::to_quoted`].
    ///
    /// Exactly one pair of surrounding `"` is stripped if present; unquoted input is parsed
    /// as is.
    pub fn from_quoted(s: &str) -> Result<Self, ParseError> {
        let inner = s
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(s);
        inner.parse()
    }

    /// Returns the string form wrapped in `"`, for embedding in structured text.
    pub fn to_quoted(&self) -> String {
        format!("\"{self}\"")
    }

    /// Returns the segments in address order.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Returns the number of segments, always at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the last segment.
    pub fn last(&self) -> &Segment {
        &self.0[self.0.len() - 1]
    }

    /// Returns a new address made of this address' segments followed by `segments`.
    pub fn join(&self, segments: impl IntoIterator<Item = Segment>) -> Addr {
        Addr(self.0.iter().cloned().chain(segments).collect())
    }

    /// Returns the address made of the segments `0..=index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn up_to(&self, index: usize) -> Addr {
        Addr(self.0[..=index].into())
    }

    fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.iter().flat_map(Segment::tokens)
    }
}

impl From<Segment> for Addr {
    fn from(segment: Segment) -> Self {
        Addr(Arc::new([segment]))
    }
}

impl FromStr for Addr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split('/');
        let mut segments = Vec::new();
        while let Some(name) = tokens.next() {
            if name.is_empty() {
                continue;
            }
            let protocol = lookup_protocol(name).context(UnknownProtocolSnafu { name })?;
            let value = if protocol.has_value() {
                let value = tokens
                    .next()
                    .filter(|value| !value.is_empty())
                    .context(MissingValueSnafu { protocol: name })?;
                protocol
                    .validate(value)
                    .context(InvalidValueSnafu { protocol: name })?;
                value.to_string()
            } else {
                String::new()
            };
            segments.push(Segment {
                protocol: name.to_string(),
                value,
                native: protocol.is_native(),
            });
        }
        Addr::from_segments(segments)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in self.0.iter() {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Addr").field(&self.to_string()).finish()
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        self.tokens().eq(other.tokens())
    }
}

impl Eq for Addr {}

impl Hash for Addr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for token in self.tokens() {
            state.write(token.as_bytes());
            state.write_u8(b'/');
        }
    }
}

impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
