//! Request metrics collector.
//!
//! All series follow Prometheus naming conventions and are prefixed with the
//! sanitized service name:
//! - `<ns>_rest_requests_total` (counter) labels: `method`, `code`, `handler`
//! - `<ns>_rest_request_duration_seconds` (histogram) label: `handler`
//! - `<ns>_process_*`, `<ns>_runtime_*` (gauges) refreshed on every scrape
//!
//! # Ownership
//!
//! The collector owns its own `PrometheusRecorder` and records through
//! `metrics::with_local_recorder`; nothing is installed globally, so several
//! pipelines (or tests) can coexist in one process.
//!
//! # Registration
//!
//! Series are declared once through `MetricsBuilder`. Declaring the same name
//! twice fails `build()` with `MetricsError::DuplicateSeries`, which callers
//! treat as a fatal startup error. Recording into a series that was never
//! declared (or declared with another kind) fails with
//! `MetricsError::UndeclaredSeries`.

use crate::observability::process::ProcessCollector;
use crate::observability::route_name::RouteIdentity;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Default latency buckets for request durations, in seconds.
pub const DEFAULT_DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

const REQUESTS_TOTAL: &str = "rest_requests_total";
const REQUEST_DURATION: &str = "rest_request_duration_seconds";
const PROCESS_RESIDENT_MEMORY: &str = "process_resident_memory_bytes";
const PROCESS_VIRTUAL_MEMORY: &str = "process_virtual_memory_bytes";
const PROCESS_CPU_USAGE: &str = "process_cpu_usage_percent";
const PROCESS_START_TIME: &str = "process_start_time_seconds";
const RUNTIME_WORKERS: &str = "runtime_workers";
const RUNTIME_ALIVE_TASKS: &str = "runtime_alive_tasks";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metric series registered twice: {0}")]
    DuplicateSeries(String),

    #[error("Invalid histogram buckets for {series}: {reason}")]
    InvalidBuckets { series: String, reason: String },

    #[error("Metric series {series} was not declared as a {kind}")]
    UndeclaredSeries { series: String, kind: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeriesKind {
    Counter,
    Gauge,
    Histogram,
}

impl SeriesKind {
    fn as_str(self) -> &'static str {
        match self {
            SeriesKind::Counter => "counter",
            SeriesKind::Gauge => "gauge",
            SeriesKind::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone)]
struct SeriesSpec {
    name: String,
    help: String,
    kind: SeriesKind,
}

/// Declares the series a `MetricsCollector` exports.
#[derive(Debug)]
pub struct MetricsBuilder {
    namespace: String,
    duration_buckets: Vec<f64>,
    extra: Vec<SeriesSpec>,
}

impl MetricsBuilder {
    /// Override the request-duration histogram buckets.
    pub fn duration_buckets(mut self, buckets: &[f64]) -> Self {
        self.duration_buckets = buckets.to_vec();
        self
    }

    /// Declare an additional counter under the collector's namespace.
    pub fn counter(self, name: &str, help: &str) -> Self {
        self.series(name, help, SeriesKind::Counter)
    }

    /// Declare an additional gauge under the collector's namespace.
    pub fn gauge(self, name: &str, help: &str) -> Self {
        self.series(name, help, SeriesKind::Gauge)
    }

    /// Declare an additional histogram under the collector's namespace.
    pub fn histogram(self, name: &str, help: &str) -> Self {
        self.series(name, help, SeriesKind::Histogram)
    }

    fn series(mut self, name: &str, help: &str, kind: SeriesKind) -> Self {
        self.extra.push(SeriesSpec {
            name: name.to_string(),
            help: help.to_string(),
            kind,
        });
        self
    }

    /// Register every declared series and build the collector.
    ///
    /// # Errors
    ///
    /// - `MetricsError::DuplicateSeries` if two series share a name
    /// - `MetricsError::InvalidBuckets` if the duration buckets are empty
    pub fn build(self) -> Result<MetricsCollector, MetricsError> {
        let ns = &self.namespace;
        let builtin = [
            (REQUESTS_TOTAL, "Total number of rest requests", SeriesKind::Counter),
            (REQUEST_DURATION, "Rest request duration", SeriesKind::Histogram),
            (PROCESS_RESIDENT_MEMORY, "Resident memory size in bytes", SeriesKind::Gauge),
            (PROCESS_VIRTUAL_MEMORY, "Virtual memory size in bytes", SeriesKind::Gauge),
            (PROCESS_CPU_USAGE, "Process CPU usage in percent of one core", SeriesKind::Gauge),
            (PROCESS_START_TIME, "Start time of the process since unix epoch in seconds", SeriesKind::Gauge),
            (RUNTIME_WORKERS, "Number of async runtime worker threads", SeriesKind::Gauge),
            (RUNTIME_ALIVE_TASKS, "Number of alive async runtime tasks", SeriesKind::Gauge),
        ];

        let declared: HashMap<String, SeriesKind> = self
            .extra
            .iter()
            .map(|spec| (spec.name.clone(), spec.kind))
            .collect();

        let specs: Vec<SeriesSpec> = builtin
            .iter()
            .map(|(name, help, kind)| SeriesSpec {
                name: (*name).to_string(),
                help: (*help).to_string(),
                kind: *kind,
            })
            .chain(self.extra)
            .collect();

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(MetricsError::DuplicateSeries(format!("{}_{}", ns, spec.name)));
            }
        }

        let requests_total = format!("{ns}_{REQUESTS_TOTAL}");
        let request_duration = format!("{ns}_{REQUEST_DURATION}");

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(request_duration.clone()), &self.duration_buckets)
            .map_err(|e| MetricsError::InvalidBuckets {
                series: request_duration.clone(),
                reason: e.to_string(),
            })?
            .build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            for spec in &specs {
                let name = format!("{}_{}", ns, spec.name);
                match spec.kind {
                    SeriesKind::Counter => describe_counter!(name, spec.help.clone()),
                    SeriesKind::Gauge => describe_gauge!(name, spec.help.clone()),
                    SeriesKind::Histogram => describe_histogram!(name, spec.help.clone()),
                }
            }
        });

        tracing::debug!(
            target: "pipeline.metrics",
            namespace = %ns,
            series = specs.len(),
            "Metric series registered"
        );

        Ok(MetricsCollector {
            namespace: self.namespace,
            requests_total,
            request_duration,
            declared,
            recorder,
            handle,
            process: ProcessCollector::new(),
        })
    }
}

/// Thread-safe request metrics, shared by every in-flight request.
pub struct MetricsCollector {
    namespace: String,
    requests_total: String,
    request_duration: String,
    declared: HashMap<String, SeriesKind>,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    process: ProcessCollector,
}

impl MetricsCollector {
    /// Start declaring series for the given service name.
    ///
    /// The name is sanitized into a Prometheus namespace (`my-svc` → `my_svc`).
    pub fn builder(service_name: &str) -> MetricsBuilder {
        MetricsBuilder {
            namespace: sanitize_namespace(service_name),
            duration_buckets: DEFAULT_DURATION_BUCKETS.to_vec(),
            extra: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Record one completed request.
    pub fn record_request(
        &self,
        route: &RouteIdentity,
        method: &str,
        status_code: u16,
        duration: Duration,
    ) {
        let handler = route.as_str().to_string();
        metrics::with_local_recorder(&self.recorder, || {
            histogram!(self.request_duration.clone(), "handler" => handler.clone())
                .record(duration.as_secs_f64());

            counter!(self.requests_total.clone(),
                "method" => method.to_string(),
                "code" => status_code.to_string(),
                "handler" => handler
            )
            .increment(1);
        });
    }

    /// Increment an additional counter declared on the builder.
    ///
    /// # Errors
    ///
    /// `MetricsError::UndeclaredSeries` if `name` was not declared as a counter.
    pub fn increment_counter(&self, name: &str, value: u64) -> Result<(), MetricsError> {
        let name = self.declared_name(name, SeriesKind::Counter)?;
        metrics::with_local_recorder(&self.recorder, || counter!(name).increment(value));
        Ok(())
    }

    /// Set an additional gauge declared on the builder.
    ///
    /// # Errors
    ///
    /// `MetricsError::UndeclaredSeries` if `name` was not declared as a gauge.
    pub fn set_gauge(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        let name = self.declared_name(name, SeriesKind::Gauge)?;
        metrics::with_local_recorder(&self.recorder, || gauge!(name).set(value));
        Ok(())
    }

    /// Record into an additional histogram declared on the builder.
    ///
    /// # Errors
    ///
    /// `MetricsError::UndeclaredSeries` if `name` was not declared as a histogram.
    pub fn record_histogram(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        let name = self.declared_name(name, SeriesKind::Histogram)?;
        metrics::with_local_recorder(&self.recorder, || histogram!(name).record(value));
        Ok(())
    }

    fn declared_name(&self, name: &str, kind: SeriesKind) -> Result<String, MetricsError> {
        let full_name = format!("{}_{}", self.namespace, name);
        match self.declared.get(name) {
            Some(declared) if *declared == kind => Ok(full_name),
            _ => Err(MetricsError::UndeclaredSeries {
                series: full_name,
                kind: kind.as_str(),
            }),
        }
    }

    pub fn process(&self) -> &ProcessCollector {
        &self.process
    }

    /// Render every series in the Prometheus text exposition format,
    /// refreshing the process and runtime gauges first.
    pub fn render(&self) -> String {
        self.refresh_process_gauges();
        self.handle.render()
    }

    fn refresh_process_gauges(&self) {
        let ns = &self.namespace;
        let process = self.process.process_snapshot();
        let runtime = self.process.runtime_snapshot();

        metrics::with_local_recorder(&self.recorder, || {
            if let Some(p) = process {
                gauge!(format!("{ns}_{PROCESS_RESIDENT_MEMORY}")).set(p.resident_memory_bytes as f64);
                gauge!(format!("{ns}_{PROCESS_VIRTUAL_MEMORY}")).set(p.virtual_memory_bytes as f64);
                gauge!(format!("{ns}_{PROCESS_CPU_USAGE}")).set(f64::from(p.cpu_usage_percent));
                gauge!(format!("{ns}_{PROCESS_START_TIME}")).set(p.start_time_seconds as f64);
            }
            if let Some(r) = runtime {
                gauge!(format!("{ns}_{RUNTIME_WORKERS}")).set(r.workers as f64);
                gauge!(format!("{ns}_{RUNTIME_ALIVE_TASKS}")).set(r.alive_tasks as f64);
            }
        });
    }
}

/// Turn a service name into a valid Prometheus metric prefix.
fn sanitize_namespace(service_name: &str) -> String {
    let mut ns: String = service_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if ns.is_empty() || ns.starts_with(|c: char| c.is_ascii_digit()) {
        ns.insert(0, '_');
    }
    ns
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pipeline_test_utils::metric_sample as sample;
    use axum::http::{Method, Uri};

    fn identity(path: &str) -> RouteIdentity {
        let uri: Uri = path.parse().unwrap();
        RouteIdentity::resolve(&Method::GET, &uri, None)
    }

    #[test]
    fn test_sanitize_namespace() {
        assert_eq!(sanitize_namespace("pipeline-service"), "pipeline_service");
        assert_eq!(sanitize_namespace("Orders.API"), "orders_api");
        assert_eq!(sanitize_namespace("9lives"), "_9lives");
    }

    #[test]
    fn test_record_request_renders_counter_and_histogram() {
        let collector = MetricsCollector::builder("svc").build().unwrap();
        collector.record_request(&identity("/api/items12345"), "GET", 200, Duration::from_millis(20));

        let rendered = collector.render();
        let labels = [("method", "GET"), ("code", "200"), ("handler", "GET /api/{param}")];
        assert_eq!(sample(&rendered, "svc_rest_requests_total", &labels), Some(1.0), "{rendered}");
        assert_eq!(
            sample(
                &rendered,
                "svc_rest_request_duration_seconds_bucket",
                &[("handler", "GET /api/{param}"), ("le", "0.05")]
            ),
            Some(1.0),
            "{rendered}"
        );
        assert_eq!(
            sample(
                &rendered,
                "svc_rest_request_duration_seconds_bucket",
                &[("handler", "GET /api/{param}"), ("le", "0.01")]
            ),
            Some(0.0),
            "{rendered}"
        );
    }

    #[test]
    fn test_duplicate_series_is_rejected() {
        let result = MetricsCollector::builder("svc")
            .counter("jobs_total", "Jobs")
            .counter("jobs_total", "Jobs again")
            .build();
        assert!(matches!(result, Err(MetricsError::DuplicateSeries(name)) if name == "svc_jobs_total"));
    }

    #[test]
    fn test_extra_series_colliding_with_builtin_is_rejected() {
        let result = MetricsCollector::builder("svc")
            .counter("rest_requests_total", "Shadow")
            .build();
        assert!(matches!(result, Err(MetricsError::DuplicateSeries(_))));
    }

    #[test]
    fn test_empty_buckets_are_rejected() {
        let result = MetricsCollector::builder("svc").duration_buckets(&[]).build();
        assert!(matches!(result, Err(MetricsError::InvalidBuckets { .. })));
    }

    #[test]
    fn test_collectors_are_isolated() {
        let a = MetricsCollector::builder("svc_a").build().unwrap();
        let b = MetricsCollector::builder("svc_b").build().unwrap();
        a.record_request(&identity("/x"), "GET", 204, Duration::from_millis(1));

        assert!(a.render().contains("svc_a_rest_requests_total"));
        assert!(!b.render().contains("svc_a_rest_requests_total"));
    }

    #[test]
    fn test_extra_counter_increments() {
        let collector = MetricsCollector::builder("svc")
            .counter("jobs_total", "Jobs processed")
            .build()
            .unwrap();
        collector.increment_counter("jobs_total", 3).unwrap();
        assert_eq!(sample(&collector.render(), "svc_jobs_total", &[]), Some(3.0));
    }

    #[test]
    fn test_extra_gauge_and_histogram_record() {
        let collector = MetricsCollector::builder("svc")
            .gauge("queue_depth", "Pending jobs")
            .histogram("job_seconds", "Job duration")
            .build()
            .unwrap();
        collector.set_gauge("queue_depth", 7.0).unwrap();
        collector.record_histogram("job_seconds", 0.25).unwrap();

        let rendered = collector.render();
        assert_eq!(sample(&rendered, "svc_queue_depth", &[]), Some(7.0), "{rendered}");
        assert_eq!(sample(&rendered, "svc_job_seconds_count", &[]), Some(1.0), "{rendered}");
    }

    #[test]
    fn test_undeclared_series_is_rejected() {
        let collector = MetricsCollector::builder("svc")
            .counter("jobs_total", "Jobs processed")
            .build()
            .unwrap();

        let err = collector.increment_counter("typo_total", 1).unwrap_err();
        assert!(
            matches!(&err, MetricsError::UndeclaredSeries { series, kind } if series == "svc_typo_total" && *kind == "counter")
        );

        // Declared, but as another kind
        assert!(matches!(
            collector.set_gauge("jobs_total", 1.0),
            Err(MetricsError::UndeclaredSeries { kind: "gauge", .. })
        ));
        assert!(collector.record_histogram("rest_requests_total", 1.0).is_err());
        assert!(!collector.render().contains("svc_typo_total"));
    }
}
