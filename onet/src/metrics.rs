//! Metrics of the dial and listen engines.
//!
//! A [`Metrics`] group travels with the [`Config`](crate::Config) of a call, see
//! [`ConfigOption::metrics`](crate::ConfigOption::metrics).

use iroh_metrics::{Counter, MetricsGroup};

/// Counters of the dial and listen engines.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "onet")]
#[non_exhaustive]
pub struct Metrics {
    /// Number of dial attempts.
    pub dials: Counter,
    /// Number of dials served over an existing mux session.
    pub dials_mux: Counter,
    /// Number of failed dials.
    pub dial_errors: Counter,
    /// Number of listeners started.
    pub listeners: Counter,
    /// Number of fully layered incoming connections.
    pub accepted: Counter,
    /// Number of incoming connections that failed to accept or layer.
    pub accept_errors: Counter,
}
