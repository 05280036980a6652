use crate::download::retry::Outcome;
use crate::report::{DownloadResult, DownloadStatus};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub graphgrab_hosts_total: Gauge,
    pub graphgrab_items_total: Gauge,
    pub graphgrab_requests_total: CounterVec,
    pub graphgrab_skipped_total: Counter,
    pub graphgrab_attempts_total: CounterVec,
    pub graphgrab_downloaded_bytes_total: Counter,
    pub graphgrab_in_flight: Gauge,
    pub graphgrab_run_duration_seconds: Gauge,
    pub graphgrab_last_run_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let graphgrab_hosts_total = Gauge::with_opts(opts!(
            "graphgrab_hosts_total",
            "Number of configured hosts"
        ))?;
        let graphgrab_items_total = Gauge::with_opts(opts!(
            "graphgrab_items_total",
            "Number of enumerated items across all hosts"
        ))?;
        let graphgrab_requests_total = CounterVec::new(
            opts!(
                "graphgrab_requests_total",
                "Finished graph requests by final status"
            ),
            &["status"],
        )?;
        let graphgrab_skipped_total = Counter::with_opts(opts!(
            "graphgrab_skipped_total",
            "Graph requests skipped because the file already existed"
        ))?;
        let graphgrab_attempts_total = CounterVec::new(
            opts!(
                "graphgrab_attempts_total",
                "HTTP attempts against the graph renderer by outcome"
            ),
            &["outcome"],
        )?;
        let graphgrab_downloaded_bytes_total = Counter::with_opts(opts!(
            "graphgrab_downloaded_bytes_total",
            "Bytes written to image files"
        ))?;
        let graphgrab_in_flight = Gauge::with_opts(opts!(
            "graphgrab_in_flight",
            "Requests currently attempting a download"
        ))?;
        let graphgrab_run_duration_seconds = Gauge::with_opts(opts!(
            "graphgrab_run_duration_seconds",
            "Wall time of the last run in seconds"
        ))?;
        let graphgrab_last_run_timestamp_seconds = Gauge::with_opts(opts!(
            "graphgrab_last_run_timestamp_seconds",
            "Unix time when the last run finished"
        ))?;

        register(&registry, &graphgrab_hosts_total)?;
        register(&registry, &graphgrab_items_total)?;
        register(&registry, &graphgrab_requests_total)?;
        register(&registry, &graphgrab_skipped_total)?;
        register(&registry, &graphgrab_attempts_total)?;
        register(&registry, &graphgrab_downloaded_bytes_total)?;
        register(&registry, &graphgrab_in_flight)?;
        register(&registry, &graphgrab_run_duration_seconds)?;
        register(&registry, &graphgrab_last_run_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            graphgrab_hosts_total,
            graphgrab_items_total,
            graphgrab_requests_total,
            graphgrab_skipped_total,
            graphgrab_attempts_total,
            graphgrab_downloaded_bytes_total,
            graphgrab_in_flight,
            graphgrab_run_duration_seconds,
            graphgrab_last_run_timestamp_seconds,
        }))
    }

    pub fn set_enumeration(&self, hosts: usize, items: usize) {
        self.graphgrab_hosts_total.set(hosts as f64);
        self.graphgrab_items_total.set(items as f64);
    }

    pub fn add_skipped(&self, count: usize) {
        self.graphgrab_skipped_total.inc_by(count as f64);
    }

    pub fn attempt_started(&self) {
        self.graphgrab_in_flight.inc();
    }

    pub fn attempt_finished(&self, outcome: Outcome) {
        self.graphgrab_in_flight.dec();
        self.graphgrab_attempts_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn record_result(&self, result: &DownloadResult) {
        let status = match result.status {
            DownloadStatus::Success => "success",
            DownloadStatus::Failed => "failed",
        };
        self.graphgrab_requests_total
            .with_label_values(&[status])
            .inc();
        self.graphgrab_downloaded_bytes_total
            .inc_by(result.bytes as f64);
    }

    pub fn finish_run(&self, elapsed: Duration) {
        self.graphgrab_run_duration_seconds
            .set(elapsed.as_secs_f64());
        self.graphgrab_last_run_timestamp_seconds
            .set(now_unix() as f64);
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }

    /// Textfile-collector output. Written via a temp file so node_exporter
    /// never reads a half-written file.
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let encoded = self
            .encode_metrics()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let tmp = path.with_extension("prom.tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
