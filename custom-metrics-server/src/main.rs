//! Serves the `my_app_num_requests` gauge over HTTP:
//! - `GET /` greeting
//! - `GET /get`, `/add`, `/remove`, `/set/{value}` gauge operations
//! - `GET /metrics` Prometheus scrape endpoint
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use anyhow::Context as _;
use clap::Parser;
use custom_metrics::{Gauge, server::ServerBuilder};
use tracing_subscriber::{EnvFilter, fmt};

/// Serve the `my_app_num_requests` gauge over HTTP, next to a Prometheus scrape endpoint.
#[derive(Debug, Parser)]
#[command(name = "custom-metrics-server", version, about)]
struct Cli {
    /// Socket address to listen on (host:port).
    #[arg(long, env = "CUSTOM_METRICS_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Path of the Prometheus scrape endpoint.
    #[arg(long, env = "CUSTOM_METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    /// Namespace prepended to every exported metric name.
    #[arg(long, env = "CUSTOM_METRICS_NAMESPACE")]
    namespace: Option<String>,

    /// Collect process metrics every N seconds.
    #[cfg(feature = "process")]
    #[arg(long, value_name = "SECS")]
    process_metrics_interval: Option<u64>,
}

impl Cli {
    fn builder(&self) -> ServerBuilder {
        let mut builder =
            ServerBuilder::new().with_address(&self.listen).with_path(&self.metrics_path);

        if let Some(namespace) = &self.namespace {
            builder = builder.with_namespace(namespace);
        }

        #[cfg(feature = "process")]
        if let Some(secs) = self.process_metrics_interval {
            builder = builder.with_process_metrics(std::time::Duration::from_secs(secs));
        }

        builder
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // The one gauge of this process, handed to the server rather than reached through a global.
    let registry = prometheus::Registry::new();
    let gauge = Gauge::requests(&registry).context("failed to register gauge")?;

    let server = cli
        .builder()
        .with_registry(registry)
        .with_gauge(gauge)
        .bind()
        .await
        .with_context(|| format!("failed to start server on {}", cli.listen))?;

    tracing::info!(
        addr = %server.local_addr(),
        metrics_path = server.metrics_path(),
        "custom-metrics-server listening"
    );

    tokio::select! {
        res = server.serve() => res.context("server failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}
