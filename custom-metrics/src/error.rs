use std::net::AddrParseError;

use thiserror::Error;

/// An error that can occur when creating and registering a [`crate::Gauge`].
#[derive(Debug, Error)]
pub enum GaugeError {
    #[error("invalid gauge {name}: {source}")]
    Prometheus {
        name: String,
        #[source]
        source: prometheus::Error,
    },
    #[error("a metric named {0} is already registered")]
    AlreadyRegistered(String),
}

/// An error that can occur when building, binding or running the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),
    #[error("invalid metrics path: {0}")]
    InvalidPath(String),
    #[error("invalid address: {0}: {1}")]
    InvalidAddress(String, AddrParseError),
    #[error(transparent)]
    Gauge(#[from] GaugeError),
    #[error("server task failed: {0}")]
    Runtime(String),
}

impl GaugeError {
    /// Map a creation or registration failure of the metric `name`.
    pub(crate) fn from_prometheus(name: &str, err: prometheus::Error) -> Self {
        match err {
            prometheus::Error::AlreadyReg => Self::AlreadyRegistered(name.to_owned()),
            source => Self::Prometheus { name: name.to_owned(), source },
        }
    }
}
