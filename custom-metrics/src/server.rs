use std::{convert::Infallible, net::SocketAddr, sync::Arc, thread, time::Duration};

use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use prometheus::{Registry, TextEncoder};
use tokio::net::TcpListener;

use crate::{Gauge, ServerError, router::Router};

/// Delay before accepting again after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Renders a registry in the Prometheus text exposition format.
#[derive(Debug, Clone)]
pub struct Exposition {
    registry: Registry,
    namespace: Option<String>,
}

impl Exposition {
    /// Create a new exposition for the registry. If a namespace is given, it is prepended to
    /// every metric family name (`<namespace>_<name>`) at render time.
    pub fn new(registry: Registry, namespace: Option<String>) -> Self {
        Self { registry, namespace }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather and encode all metrics in the registry.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut metrics = self.registry.gather();

        // Set the global prefix for the metrics
        if let Some(prefix) = &self.namespace {
            metrics.iter_mut().for_each(|metric| {
                if let Some(name) = metric.name.as_mut() {
                    name.insert(0, '_');
                    name.insert_str(0, prefix);
                };
            });
        }

        TextEncoder::new().encode_to_string(&metrics)
    }
}

/// A builder for the HTTP server that serves the gauge routes and the scrape endpoint.
#[derive(Debug)]
pub struct ServerBuilder {
    registry: Option<Registry>,
    gauge: Option<Gauge>,
    address: String,
    path: String,
    namespace: Option<String>,
    process_metrics_poll_interval: Option<Duration>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            gauge: None,
            address: "0.0.0.0:8080".to_owned(),
            path: "/metrics".to_owned(),
            namespace: None,
            process_metrics_poll_interval: None,
        }
    }
}

impl ServerBuilder {
    /// Create a new builder listening on `0.0.0.0:8080` and serving metrics on `/metrics`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the socket address for the server.
    ///
    /// A malformed address is reported by [`ServerBuilder::bind`] as
    /// [`ServerError::InvalidAddress`].
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the path of the scrape endpoint. Must start with `/`; trailing slashes are removed.
    /// It cannot shadow one of the gauge routes.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the global namespace for the metrics in the associated registry. This will be prepended
    /// to all metric names.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the registry for the server. Defaults to a fresh, empty registry.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Serve an existing gauge instead of creating [`Gauge::requests`] at bind time. The gauge
    /// should be registered with the registry passed to [`ServerBuilder::with_registry`], or it
    /// won't show up on the scrape endpoint.
    pub fn with_gauge(mut self, gauge: Gauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Also collect process metrics, polling at the given interval in the background.
    ///
    /// A 10 second interval is a good default for most applications.
    #[cfg(feature = "process")]
    pub fn with_process_metrics(mut self, poll_interval: Duration) -> Self {
        self.process_metrics_poll_interval = Some(poll_interval);
        self
    }

    fn path(&self) -> Result<String, ServerError> {
        if !self.path.starts_with('/') {
            return Err(ServerError::InvalidPath(self.path.clone()));
        }

        // Remove trailing slashes from path. An empty result means the root, which is the greeting.
        let path = self.path.trim_end_matches('/');
        if path.is_empty() || crate::router::is_application_path(path) {
            return Err(ServerError::InvalidPath(self.path.clone()));
        }

        Ok(path.to_owned())
    }

    fn address(&self) -> Result<SocketAddr, ServerError> {
        self.address.parse().map_err(|e| ServerError::InvalidAddress(self.address.clone(), e))
    }

    /// Validate the configuration, create the gauge and bind the listener synchronously, so that
    /// errors surface before anything is spawned.
    fn prepare(self) -> Result<Parts, ServerError> {
        let path = self.path()?;
        let address = self.address()?;
        let registry = self.registry.unwrap_or_else(Registry::new);
        let gauge = match self.gauge {
            Some(gauge) => gauge,
            None => Gauge::requests(&registry)?,
        };

        let listener = std::net::TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;

        let exposition = Exposition::new(registry.clone(), self.namespace);
        let router = Router::new(gauge, exposition, path);

        Ok(Parts {
            listener,
            router,
            registry,
            process_metrics_poll_interval: self.process_metrics_poll_interval,
        })
    }

    /// Bind the server. Call [`Server::serve`] on the result to start answering requests.
    pub async fn bind(self) -> Result<Server, ServerError> {
        Server::from_parts(self.prepare()?)
    }

    /// Install the server with the given configuration and start serving in the background.
    /// Uses [hyper] for the HTTP server and [tokio] for the runtime.
    ///
    /// # Behavior
    /// - If a Tokio runtime is available, use it to spawn the server.
    /// - Otherwise, spawn a new single-threaded Tokio runtime on a thread, and spawn the server
    ///   there.
    pub fn install(self) -> Result<(), ServerError> {
        let parts = self.prepare()?;

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let server = Server::from_parts(parts)?;
            runtime.spawn(serve_logged(server));
        } else {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ServerError::Runtime(e.to_string()))?;

            // Registering the listener needs the runtime's reactor.
            let server = {
                let _guard = runtime.enter();
                Server::from_parts(parts)?
            };

            thread::spawn(move || runtime.block_on(serve_logged(server)));
        }

        Ok(())
    }
}

/// Everything [`ServerBuilder::prepare`] resolves before a runtime is needed.
#[derive(Debug)]
struct Parts {
    listener: std::net::TcpListener,
    router: Router,
    registry: Registry,
    process_metrics_poll_interval: Option<Duration>,
}

/// A bound server. Nothing is answered until [`Server::serve`] is polled.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Arc<Router>,
    registry: Registry,
    process_metrics_poll_interval: Option<Duration>,
}

impl Server {
    fn from_parts(parts: Parts) -> Result<Self, ServerError> {
        let listener = TcpListener::from_std(parts.listener)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            router: Arc::new(parts.router),
            registry: parts.registry,
            process_metrics_poll_interval: parts.process_metrics_poll_interval,
        })
    }

    /// The address the server is listening on. Useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The gauge served by the routes.
    pub fn gauge(&self) -> &Gauge {
        self.router.gauge()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn metrics_path(&self) -> &str {
        self.router.metrics_path()
    }

    /// Accept connections and answer requests until the future is dropped.
    pub async fn serve(self) -> Result<(), ServerError> {
        let serve = accept(self.listener, self.router);
        let collect = collect_process_metrics(self.registry, self.process_metrics_poll_interval);

        tokio::try_join!(serve, collect)?;
        Ok(())
    }
}

async fn serve_logged(server: Server) {
    let local_addr = server.local_addr();
    if let Err(e) = server.serve().await {
        tracing::error!(%local_addr, error = %e, "server failed");
    }
}

async fn accept(listener: TcpListener, router: Arc<Router>) -> Result<(), ServerError> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let router = Arc::clone(&router);

        let service = service_fn(move |req: Request<Incoming>| {
            let router = Arc::clone(&router);
            async move { Ok::<_, Infallible>(router.handle(&req)) }
        });

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

/// If the "process" feature is enabled AND the poll interval is provided, collect
/// process metrics at the given interval. Otherwise, no-op.
///
/// NOTE: the return type is Result to use [`tokio::try_join!`] with [`accept`].
async fn collect_process_metrics(
    _registry: Registry,
    _poll_interval: Option<Duration>,
) -> Result<(), ServerError> {
    #[cfg(feature = "process")]
    if let Some(interval) = _poll_interval {
        let mut collector = crate::process::ProcessCollector::new(&_registry)?;
        loop {
            collector.collect();
            tokio::time::sleep(interval).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_path() {
        let builder = ServerBuilder::new().with_path("/metrics/");
        assert_eq!(builder.path().unwrap(), "/metrics");

        let builder = ServerBuilder::new().with_path("/internal/metrics");
        assert_eq!(builder.path().unwrap(), "/internal/metrics");
    }

    #[test]
    fn rejects_invalid_paths() {
        for path in ["", "metrics", "/", "//", "/get", "/ADD/", "/remove", "/set/1"] {
            let builder = ServerBuilder::new().with_path(path);
            assert!(matches!(builder.path(), Err(ServerError::InvalidPath(_))), "{path}");
        }
    }

    #[test]
    fn rejects_invalid_address() {
        let builder = ServerBuilder::new().with_address("not an address");
        assert!(matches!(builder.address(), Err(ServerError::InvalidAddress(..))));
    }

    #[test]
    fn prepare_reports_duplicate_gauge() {
        let registry = Registry::new();
        let _gauge = Gauge::requests(&registry).unwrap();

        let err = ServerBuilder::new()
            .with_address("127.0.0.1:0")
            .with_registry(registry)
            .prepare()
            .unwrap_err();
        assert!(matches!(err, ServerError::Gauge(_)));
    }

    #[test]
    fn renders_with_namespace() {
        let registry = Registry::new();
        let gauge = Gauge::requests(&registry).unwrap();
        gauge.set(3);

        let body = Exposition::new(registry.clone(), Some("sample".to_owned())).render().unwrap();
        assert!(body.contains("# TYPE sample_my_app_num_requests gauge"));
        assert!(body.contains("sample_my_app_num_requests 3"));

        // The namespace is applied at render time only.
        let body = Exposition::new(registry, None).render().unwrap();
        assert!(body.contains("\nmy_app_num_requests 3"));
    }

    #[tokio::test]
    async fn binds_to_ephemeral_port() {
        let server = ServerBuilder::new().with_address("127.0.0.1:0").bind().await.unwrap();

        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.metrics_path(), "/metrics");
        assert_eq!(server.gauge().value(), 0.0);
        assert_eq!(server.registry().gather().len(), 1);
    }

    #[tokio::test]
    async fn injected_gauge_is_served() {
        let registry = Registry::new();
        let gauge = Gauge::requests(&registry).unwrap();
        gauge.set(9);

        let server = ServerBuilder::new()
            .with_address("127.0.0.1:0")
            .with_registry(registry)
            .with_gauge(gauge.clone())
            .bind()
            .await
            .unwrap();

        server.gauge().inc();
        assert_eq!(gauge.value(), 10.0);
    }
}
