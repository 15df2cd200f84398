use prometheus::{
    Gauge, Registry,
    core::{AtomicU64, Collector, GenericGauge},
};
use sysinfo::{CpuRefreshKind, Pid, ProcessRefreshKind, RefreshKind, System};

use crate::GaugeError;

type UintGauge = GenericGauge<AtomicU64>;

/// A collector for statistics about the current process.
///
/// # Metrics
/// See the documentation for the [`ProcessMetrics`] struct for the list of metrics.
///
/// # Example
/// ```rust
/// use prometheus::Registry;
/// use custom_metrics::process::ProcessCollector;
///
/// let registry = Registry::new();
/// let mut collector = ProcessCollector::new(&registry).unwrap();
///
/// // Collect the metrics
/// collector.collect();
/// ```
pub struct ProcessCollector {
    specifics: RefreshKind,
    sys: System,
    pid: Pid,
    cores: u64,

    metrics: ProcessMetrics,
}

impl std::fmt::Debug for ProcessCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCollector").field("pid", &self.pid).finish_non_exhaustive()
    }
}

impl ProcessCollector {
    /// Create a new `ProcessCollector` and register its metrics with the given registry.
    pub fn new(registry: &Registry) -> Result<Self, GaugeError> {
        let specifics = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_processes(ProcessRefreshKind::nothing().with_cpu().with_memory().with_tasks());

        let mut sys = System::new_with_specifics(specifics);

        // Refresh immediately so the first CPU usage sample has a baseline.
        sys.refresh_specifics(specifics);

        let pid = Pid::from_u32(std::process::id());
        let cores = sys.cpus().len().max(1) as u64;
        let metrics = ProcessMetrics::new(registry)?;

        Ok(Self { specifics, sys, pid, cores, metrics })
    }

    /// Refresh the process statistics and update the gauges.
    pub fn collect(&mut self) {
        self.sys.refresh_specifics(self.specifics);

        let Some(process) = self.sys.process(self.pid) else {
            tracing::debug!(pid = %self.pid, "current process not found, skipping collection");
            return;
        };

        let cpu_usage = process.cpu_usage() as f64 / self.cores as f64;
        let threads = process.tasks().map(|tasks| tasks.len()).unwrap_or(0);
        let open_handles = process.open_files().unwrap_or(0);

        self.metrics.cpu_usage.set(cpu_usage);
        self.metrics.working_set.set(process.memory());
        self.metrics.virtual_memory.set(process.virtual_memory());
        self.metrics.start_time.set(process.start_time());
        self.metrics.threads.set(threads as u64);
        self.metrics.open_handles.set(open_handles as u64);
    }
}

/// The gauges published by a [`ProcessCollector`].
pub struct ProcessMetrics {
    /// The CPU usage of the process as a percentage of the capacity of all cores (0 to 100).
    cpu_usage: Gauge,
    /// The resident memory of the process in bytes.
    working_set: UintGauge,
    /// The virtual memory size of the process in bytes.
    virtual_memory: UintGauge,
    /// The start time of the process in UNIX seconds.
    start_time: UintGauge,
    /// The number of OS threads used by the process (Linux only).
    threads: UintGauge,
    /// The number of open file descriptors or handles of the process.
    open_handles: UintGauge,
}

impl std::fmt::Debug for ProcessMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMetrics").finish_non_exhaustive()
    }
}

impl ProcessMetrics {
    pub fn new(registry: &Registry) -> Result<Self, GaugeError> {
        Ok(Self {
            cpu_usage: register(
                registry,
                "process_cpu_usage",
                Gauge::new(
                    "process_cpu_usage",
                    "The CPU usage of the process as a percentage of all logical cores.",
                ),
            )?,
            working_set: register(
                registry,
                "process_working_set_bytes",
                UintGauge::new(
                    "process_working_set_bytes",
                    "Process working set (resident memory) in bytes.",
                ),
            )?,
            virtual_memory: register(
                registry,
                "process_virtual_memory_bytes",
                UintGauge::new(
                    "process_virtual_memory_bytes",
                    "Virtual memory size of the process in bytes.",
                ),
            )?,
            start_time: register(
                registry,
                "process_start_time_seconds",
                UintGauge::new(
                    "process_start_time_seconds",
                    "Start time of the process since unix epoch in seconds.",
                ),
            )?,
            threads: register(
                registry,
                "process_num_threads",
                UintGauge::new("process_num_threads", "Total number of threads."),
            )?,
            open_handles: register(
                registry,
                "process_open_handles",
                UintGauge::new("process_open_handles", "Number of open handles."),
            )?,
        })
    }
}

/// Register a freshly created metric, mapping both failure points to [`GaugeError`].
fn register<M>(registry: &Registry, name: &str, metric: prometheus::Result<M>) -> Result<M, GaugeError>
where
    M: Collector + Clone + 'static,
{
    let metric = metric.map_err(|e| GaugeError::from_prometheus(name, e))?;
    registry.register(Box::new(metric.clone())).map_err(|e| GaugeError::from_prometheus(name, e))?;
    Ok(metric)
}
