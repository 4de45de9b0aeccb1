//! The global protocol registry.
//!
//! Every segment name that can appear in an [`Addr`] must be registered here first.  A
//! [`Protocol`] decides whether its segment carries a value token (it does iff it has a
//! [`Validator`]) and whether it marks a native transport boundary.
//!
//! The registry is process wide and append-only.  Registration is expected to happen
//! during initialization, before any address is parsed; lookups are cheap concurrent reads
//! afterwards.
//!
//! The protocols `ip`, `tcp` and `udp` are built in.
//!
//! [`Addr`]: crate::Addr

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    net::IpAddr,
    num::ParseIntError,
    str::FromStr,
    sync::{Arc, LazyLock, RwLock},
};

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};

use crate::ErrorKind;

/// Checks the value token of a segment.
pub type Validator = fn(&str) -> Result<(), ValueError>;

/// A named kind of address segment.
#[derive(Clone)]
pub struct Protocol {
    name: String,
    validator: Option<Validator>,
    native: bool,
}

impl Protocol {
    /// Creates a value-less, non-native protocol.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validator: None,
            native: false,
        }
    }

    /// Requires a value token after the protocol name, checked by `validator`.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Marks the protocol as a native transport boundary.
    pub fn with_native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    /// Returns the protocol name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether segments of this protocol consume a value token.
    pub fn has_value(&self) -> bool {
        self.validator.is_some()
    }

    /// Returns whether this protocol marks a native transport boundary.
    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Runs the validator against `value`.
    ///
    /// Protocols without a validator accept anything.
    pub fn validate(&self, value: &str) -> Result<(), ValueError> {
        match self.validator {
            Some(validator) => validator(value),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("has_value", &self.has_value())
            .field("native", &self.native)
            .finish()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A segment value rejected by a protocol validator.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(module)]
pub enum ValueError {
    #[snafu(display("invalid ip address {value:?}"))]
    Ip {
        value: String,
        source: std::net::AddrParseError,
    },
    #[snafu(display("invalid port {value:?}"))]
    Port { value: String, source: ParseIntError },
    #[snafu(display("{message}"))]
    Custom { message: String },
}

impl ValueError {
    /// Creates a validation error with a free-form message.
    ///
    /// This is meant for validators of protocols registered outside this crate.
    pub fn custom(message: impl Into<String>) -> Self {
        value_error::CustomSnafu {
            message: message.into(),
        }
        .build()
    }
}

/// Registering a protocol or transport failed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RegisterError {
    #[snafu(display("{what} {name} already registered"))]
    AlreadyRegistered { what: &'static str, name: String },
}

impl RegisterError {
    /// Returns an error for a name that is already taken.
    ///
    /// `what` names the registry, e.g. `"protocol"` or `"transport"`.
    pub fn already_registered(what: &'static str, name: impl Into<String>) -> Self {
        AlreadyRegisteredSnafu {
            what,
            name: name.into(),
        }
        .build()
    }

    /// Returns the name that was already registered.
    pub fn name(&self) -> &str {
        match self {
            RegisterError::AlreadyRegistered { name, .. } => name,
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::AlreadyRegistered
    }
}

fn check_ip(value: &str) -> Result<(), ValueError> {
    IpAddr::from_str(value).context(value_error::IpSnafu { value })?;
    Ok(())
}

fn check_port(value: &str) -> Result<(), ValueError> {
    u16::from_str(value).context(value_error::PortSnafu { value })?;
    Ok(())
}

static PROTOCOLS: LazyLock<RwLock<BTreeMap<String, Arc<Protocol>>>> = LazyLock::new(|| {
    let builtin = [
        Protocol::new("ip").with_validator(check_ip),
        Protocol::new("udp").with_validator(check_port),
        Protocol::new("tcp").with_validator(check_port),
    ];
    let protocols = builtin
        .into_iter()
        .map(|protocol| (protocol.name.clone(), Arc::new(protocol)))
        .collect();
    RwLock::new(protocols)
});

/// Registers a protocol.
///
/// Fails if a protocol with the same name exists; the existing registration is kept.
pub fn register_protocol(protocol: Protocol) -> Result<(), RegisterError> {
    let mut protocols = PROTOCOLS.write().expect("poisoned");
    match protocols.entry(protocol.name.clone()) {
        Entry::Occupied(_) => Err(RegisterError::already_registered("protocol", protocol.name)),
        Entry::Vacant(entry) => {
            entry.insert(Arc::new(protocol));
            Ok(())
        }
    }
}

/// Registers several protocols, stopping at the first failure.
///
/// Protocols registered before the failing one stay registered.
pub fn register_protocols(
    protocols: impl IntoIterator<Item = Protocol>,
) -> Result<(), RegisterError> {
    for protocol in protocols {
        register_protocol(protocol)?;
    }
    Ok(())
}

/// Looks up a protocol by name.
pub fn lookup_protocol(name: &str) -> Option<Arc<Protocol>> {
    PROTOCOLS.read().expect("poisoned").get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_protocols() {
        let ip = lookup_protocol("ip").unwrap();
        assert!(ip.has_value());
        assert!(!ip.is_native());
        ip.validate("127.0.0.1").unwrap();
        ip.validate("::1").unwrap();
        assert!(matches!(
            ip.validate("127.0.0.256"),
            Err(ValueError::Ip { .. })
        ));

        for name in ["tcp", "udp"] {
            let port = lookup_protocol(name).unwrap();
            port.validate("0").unwrap();
            port.validate("65535").unwrap();
            assert!(matches!(
                port.validate("65536"),
                Err(ValueError::Port { .. })
            ));
            assert!(matches!(port.validate("-1"), Err(ValueError::Port { .. })));
            assert!(matches!(port.validate("http"), Err(ValueError::Port { .. })));
        }
    }

    #[test]
    fn test_register_duplicate_keeps_original() {
        register_protocol(Protocol::new("proto-dup").with_native(true)).unwrap();

        let err = register_protocol(Protocol::new("proto-dup")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);
        assert_eq!(err.name(), "proto-dup");

        let original = lookup_protocol("proto-dup").unwrap();
        assert!(original.is_native());
    }

    #[test]
    fn test_register_protocols_stops_at_first_failure() {
        let res = register_protocols([
            Protocol::new("proto-batch-a"),
            Protocol::new("tcp"),
            Protocol::new("proto-batch-b"),
        ]);
        assert!(res.is_err());
        assert!(lookup_protocol("proto-batch-a").is_some());
        assert!(lookup_protocol("proto-batch-b").is_none());
    }

    #[test]
    fn test_custom_value_error() {
        let err = ValueError::custom("must not be empty");
        assert_eq!(err.to_string(), "must not be empty");
    }
}
