//! Named options shared by all transports of an overlay network.
//!
//! A [`Config`] is built fresh for every dial or listen call by applying the caller's
//! [`ConfigOption`]s in order.  Transports read the options they understand by name, e.g.
//! a TLS transport might look up its certificate under `"tls.cert"`.

use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use nested_enum_utils::common_fields;
use onet_base::ErrorKind;
use snafu::{Backtrace, Snafu, ensure};

use crate::metrics::Metrics;

/// Applying a [`ConfigOption`] failed.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("option {name} already bound"))]
    AlreadyBound { name: String },
    #[snafu(display("invalid option {name}: {message}"))]
    Invalid { name: String, message: String },
}

impl ConfigError {
    /// Creates an error for an option value that was rejected.
    pub fn invalid(name: impl Into<String>, message: impl Into<String>) -> Self {
        InvalidSnafu {
            name: name.into(),
            message: message.into(),
        }
        .build()
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::AlreadyBound { .. } => ErrorKind::AlreadyRegistered,
            ConfigError::Invalid { .. } => ErrorKind::InvalidParams,
        }
    }
}

/// Typed options, keyed by name.
///
/// Cloning is cheap, the values are shared.  A config also carries the [`Metrics`] that
/// dial and listen calls using it record to; by default every config has its own.
#[derive(Clone, Default)]
pub struct Config {
    values: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
    metrics: Arc<Metrics>,
}

impl Config {
    /// Creates an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config by applying `options` in order.
    pub fn from_options(
        options: impl IntoIterator<Item = ConfigOption>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        for option in options {
            option.apply(&mut config)?;
        }
        Ok(config)
    }

    /// Binds `value` under `name`.
    ///
    /// Each name can be bound once.
    pub fn bind<T: Any + Send + Sync>(
        &mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        ensure!(
            !self.values.contains_key(&name),
            AlreadyBoundSnafu { name }
        );
        self.values.insert(name, Arc::new(value));
        Ok(())
    }

    /// Returns the value bound under `name`, if there is one of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.values.get(name)?.clone().downcast::<T>().ok()
    }

    /// Returns whether anything is bound under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Returns the metrics of the calls using this config.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Records the calls using this config to `metrics`.
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = metrics;
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A deferred modification of a [`Config`].
///
/// Options are applied by [`OverlayNetwork::parse`] before the address is resolved; the
/// first failing option aborts resolution.
///
/// [`OverlayNetwork::parse`]: crate::OverlayNetwork::parse
pub struct ConfigOption(Box<dyn FnOnce(&mut Config) -> Result<(), ConfigError> + Send>);

impl ConfigOption {
    /// Creates an option from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut Config) -> Result<(), ConfigError> + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// Creates an option that binds `value` under `name`.
    pub fn bind<T: Any + Send + Sync>(name: impl Into<String>, value: T) -> Self {
        let name = name.into();
        Self::new(move |config| config.bind(name, value))
    }

    /// Creates an option that makes the call record to `metrics`.
    ///
    /// Passing the same group to several calls aggregates their counters.
    pub fn metrics(metrics: Arc<Metrics>) -> Self {
        Self::new(move |config| {
            config.set_metrics(metrics);
            Ok(())
        })
    }

    fn apply(self, config: &mut Config) -> Result<(), ConfigError> {
        (self.0)(config)
    }
}

impl fmt::Debug for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfigOption")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_get() {
        let mut config = Config::new();
        config.bind("mux.window", 64u32).unwrap();
        config.bind("tls.server_name", String::from("example.com")).unwrap();

        assert_eq!(*config.get::<u32>("mux.window").unwrap(), 64);
        assert_eq!(
            config.get::<String>("tls.server_name").unwrap().as_str(),
            "example.com"
        );
        assert!(config.get::<u64>("mux.window").is_none());
        assert!(config.get::<u32>("missing").is_none());
        assert!(config.contains("mux.window"));

        let err = config.bind("mux.window", 1u32).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);
        assert_eq!(*config.get::<u32>("mux.window").unwrap(), 64);
    }

    #[test]
    fn test_options_apply_in_order() {
        let config = Config::from_options([
            ConfigOption::bind("a", 1u8),
            ConfigOption::new(|config| {
                let a = config.get::<u8>("a").map(|a| *a).unwrap_or_default();
                config.bind("b", a + 1)
            }),
        ])
        .unwrap();
        assert_eq!(*config.get::<u8>("b").unwrap(), 2);
        assert_eq!(format!("{config:?}"), r#"Config { names: ["a", "b"] }"#);
    }

    #[test]
    fn test_metrics_option_shares_group() {
        let metrics = Arc::new(Metrics::default());
        let config = Config::from_options([ConfigOption::metrics(metrics.clone())]).unwrap();
        assert!(Arc::ptr_eq(config.metrics(), &metrics));

        let other = Config::new();
        assert!(!Arc::ptr_eq(other.metrics(), &metrics));
    }

    #[test]
    fn test_failing_option_aborts() {
        let err = Config::from_options([
            ConfigOption::new(|_| Err(ConfigError::invalid("kcp.mtu", "too small"))),
            ConfigOption::bind("never", ()),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert_eq!(err.to_string(), "invalid option kcp.mtu: too small");
    }
}
