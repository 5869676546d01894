//! Metrics instrumentation: counters/gauges recorded through the `metrics`
//! facade, a background collector that samples process memory, and a
//! `PrometheusExporter` that installs the exporter recorder.

use metrics::{Counter, Gauge};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub struct Metrics {
    pub requests_enqueued: Counter,
    pub requests_fetched: Counter,
    pub requests_handled: Counter,
    pub requests_reclaimed: Counter,
    pub request_errors: Counter,
    pub sessions_created: Counter,
    pub sessions_retired: Counter,
    pub pool_desired_concurrency: Gauge,
    pub pool_running_count: Gauge,
    pub memory_usage: Gauge,
    pub memory_overloaded: Gauge,
    pub event_loop_overloaded: Gauge,
    pub cpu_overloaded: Gauge,
    pub client_overloaded: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_enqueued: Counter::noop(),
            requests_fetched: Counter::noop(),
            requests_handled: Counter::noop(),
            requests_reclaimed: Counter::noop(),
            request_errors: Counter::noop(),
            sessions_created: Counter::noop(),
            sessions_retired: Counter::noop(),
            pool_desired_concurrency: Gauge::noop(),
            pool_running_count: Gauge::noop(),
            memory_usage: Gauge::noop(),
            memory_overloaded: Gauge::noop(),
            event_loop_overloaded: Gauge::noop(),
            cpu_overloaded: Gauge::noop(),
            client_overloaded: Gauge::noop(),
        }
    }

    pub fn record_request_enqueued(&self) {
        self.requests_enqueued.increment(1);
    }

    pub fn record_request_fetched(&self) {
        self.requests_fetched.increment(1);
    }

    pub fn record_request_handled(&self) {
        self.requests_handled.increment(1);
    }

    pub fn record_request_reclaimed(&self) {
        self.requests_reclaimed.increment(1);
    }

    pub fn record_request_error(&self) {
        self.request_errors.increment(1);
    }

    pub fn record_session_created(&self) {
        self.sessions_created.increment(1);
    }

    pub fn record_session_retired(&self) {
        self.sessions_retired.increment(1);
    }

    pub fn set_pool_concurrency(&self, desired: usize, running: usize) {
        self.pool_desired_concurrency.set(desired as f64);
        self.pool_running_count.set(running as f64);
    }

    pub fn record_memory_usage(&self, bytes: u64) {
        self.memory_usage.set(bytes as f64);
    }

    pub fn set_overload_flags(&self, memory: bool, event_loop: bool, cpu: bool, client: bool) {
        self.memory_overloaded.set(memory as u8 as f64);
        self.event_loop_overloaded.set(event_loop as u8 as f64);
        self.cpu_overloaded.set(cpu as u8 as f64);
        self.client_overloaded.set(client as u8 as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically samples process RSS into `metrics.memory_usage`, leaving
/// dimension-specific overload gauges to whoever owns the `SystemStatus`
/// poll (see `health::CrawlHealthChecker`).
pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    start_time: Instant,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics, start_time: Instant::now(), collection_interval: Duration::from_secs(10) }
    }

    pub async fn start_collection(&self) {
        let metrics = self.metrics.clone();
        let interval = self.collection_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            loop {
                interval_timer.tick().await;
                if let Ok(bytes) = Self::get_memory_usage() {
                    metrics.record_memory_usage(bytes);
                }
                info!("metrics collection tick");
            }
        });
    }

    fn get_memory_usage() -> Result<u64, std::io::Error> {
        if let Ok(content) = std::fs::read_to_string("/proc/self/status") {
            for line in content.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|s| s.parse::<u64>().ok()) {
                        return Ok(kb * 1024);
                    }
                }
            }
        }
        Ok(0)
    }

    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(_metrics: Arc<Metrics>, port: u16) -> Self {
        Self { port }
    }

    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        metrics::set_boxed_recorder(Box::new(recorder))?;
        info!("Starting Prometheus metrics server on port {}", self.port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_lifecycle_does_not_panic() {
        let metrics = Metrics::new();
        metrics.record_request_enqueued();
        metrics.record_request_fetched();
        metrics.record_request_handled();
        metrics.set_pool_concurrency(4, 2);
        metrics.set_overload_flags(false, false, true, false);
    }

    #[tokio::test]
    async fn test_collector_uptime_increases() {
        let collector = MetricsCollector::new(Arc::new(Metrics::new()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(collector.get_uptime() >= Duration::from_millis(5));
    }
}
