use std::fmt;

use crate::{GaugeError, IntoGaugeValue};

/// Name of the application gauge.
pub const REQUESTS_GAUGE_NAME: &str = "my_app_num_requests";

/// Help text of the application gauge.
pub const REQUESTS_GAUGE_HELP: &str = "Number of requests.";

/// A floating point gauge registered with a Prometheus registry.
///
/// Cloning a [`Gauge`] yields another handle to the same underlying value, so a single instance can
/// be created at startup and shared with every request handler. All updates go through
/// [`prometheus::core::AtomicF64`], which makes concurrent `inc`/`dec`/`set` calls lossless.
pub struct Gauge {
    name: String,
    help: String,
    inner: prometheus::Gauge,
}

impl Clone for Gauge {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), help: self.help.clone(), inner: self.inner.clone() }
    }
}

impl fmt::Debug for Gauge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gauge").field("name", &self.name).field("value", &self.value()).finish()
    }
}

impl Gauge {
    /// Create a new gauge with the given name and help text, and register it with the registry.
    ///
    /// Unlike plain Prometheus collectors, a name can only be registered once per registry: a
    /// second registration returns [`GaugeError::AlreadyRegistered`] instead of shadowing the
    /// first gauge.
    pub fn new(registry: &prometheus::Registry, name: &str, help: &str) -> Result<Self, GaugeError> {
        let opts = prometheus::Opts::new(name, help);
        let metric = prometheus::Gauge::with_opts(opts)
            .map_err(|e| GaugeError::from_prometheus(name, e))?;

        registry
            .register(Box::new(metric.clone()))
            .map_err(|e| GaugeError::from_prometheus(name, e))?;

        tracing::debug!(name, "registered gauge");

        Ok(Self { name: name.to_owned(), help: help.to_owned(), inner: metric })
    }

    /// Create the application gauge ([`REQUESTS_GAUGE_NAME`]) in the given registry.
    pub fn requests(registry: &prometheus::Registry) -> Result<Self, GaugeError> {
        Self::new(registry, REQUESTS_GAUGE_NAME, REQUESTS_GAUGE_HELP)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    /// Returns the current value.
    pub fn value(&self) -> f64 {
        self.inner.get()
    }

    pub fn inc(&self) {
        self.inner.inc();
        tracing::trace!(name = %self.name, "gauge incremented");
    }

    pub fn dec(&self) {
        self.inner.dec();
        tracing::trace!(name = %self.name, "gauge decremented");
    }

    /// Overwrite the current value. Accepts any of the numeric types implementing
    /// [`IntoGaugeValue`].
    pub fn set(&self, value: impl IntoGaugeValue) {
        let value = value.into_gauge_value();
        self.inner.set(value);
        tracing::trace!(name = %self.name, value, "gauge set");
    }
}
