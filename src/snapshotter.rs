//! `Snapshotter`: periodically samples four resource dimensions — memory,
//! event-loop latency, CPU overload, and upstream client errors — and
//! exposes bounded, windowed read access to their histories.

use crate::config::SnapshotterConfig;
use crate::events::{CrawlEvent, EventBus};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct MemorySnapshot {
    pub created_at: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub main_process_bytes: u64,
    pub child_processes_bytes: u64,
    pub is_overloaded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EventLoopSnapshot {
    pub created_at: u64,
    pub exceeded_millis: u64,
    pub is_overloaded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CpuSnapshot {
    pub created_at: u64,
    pub is_overloaded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientSnapshot {
    pub created_at: u64,
    pub rate_limit_error_count: u64,
    pub is_overloaded: bool,
}

struct History<T> {
    samples: VecDeque<T>,
}

impl<T> History<T> {
    fn new() -> Self {
        Self { samples: VecDeque::new() }
    }
}

pub struct Snapshotter {
    config: SnapshotterConfig,
    events: EventBus,
    memory: Arc<Mutex<History<MemorySnapshot>>>,
    event_loop: Arc<Mutex<History<EventLoopSnapshot>>>,
    cpu: Arc<Mutex<History<CpuSnapshot>>>,
    client: Arc<Mutex<History<ClientSnapshot>>>,
    client_error_count: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    critical_warned: Arc<AtomicBool>,
}

impl Snapshotter {
    pub fn new(config: SnapshotterConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            memory: Arc::new(Mutex::new(History::new())),
            event_loop: Arc::new(Mutex::new(History::new())),
            cpu: Arc::new(Mutex::new(History::new())),
            client: Arc::new(Mutex::new(History::new())),
            client_error_count: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            critical_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Called by user task code whenever the upstream signals a rate limit;
    /// accumulated for the client-snapshot delta computation.
    pub fn record_client_error(&self) {
        self.client_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Relaxed);
        let mut tasks = self.tasks.lock().await;

        tasks.push(self.spawn_memory_loop());
        tasks.push(self.spawn_event_loop_probe());
        tasks.push(self.spawn_client_loop());
        tasks.push(self.spawn_cpu_subscriber());
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn spawn_memory_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(this.config.memory_snapshot_interval);
            while this.running.load(Ordering::Relaxed) {
                timer.tick().await;
                this.sample_memory().await;
            }
        })
    }

    fn spawn_event_loop_probe(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(this.config.event_loop_snapshot_interval);
            while this.running.load(Ordering::Relaxed) {
                timer.tick().await;
                this.sample_event_loop().await;
            }
        })
    }

    fn spawn_client_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(this.config.client_snapshot_interval);
            let mut last_count = 0u64;
            while this.running.load(Ordering::Relaxed) {
                timer.tick().await;
                last_count = this.sample_client(last_count).await;
            }
        })
    }

    fn spawn_cpu_subscriber(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            while this.running.load(Ordering::Relaxed) {
                match rx.recv().await {
                    Ok(CrawlEvent::CpuOverloaded { is_overloaded, created_at }) => {
                        let mut history = this.cpu.lock().await;
                        history.samples.push_back(CpuSnapshot { created_at, is_overloaded });
                        this.prune(&mut history.samples, this.config.snapshot_history);
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
    }

    pub(crate) async fn sample_memory(&self) {
        let main_process_bytes = read_proc_self_rss().unwrap_or(0);
        let child_processes_bytes = 0; // this core does not spawn child processes itself
        let total_bytes = self.config.memory_mbytes.unwrap_or(8 * 1024) as u64 * 1024 * 1024;

        let numerator = if self.config.ignore_main_process {
            child_processes_bytes
        } else {
            main_process_bytes + child_processes_bytes
        };
        let ratio = if total_bytes > 0 { numerator as f64 / total_bytes as f64 } else { 0.0 };
        let is_overloaded = ratio > self.config.max_used_memory_ratio;

        if ratio > self.config.critical_overload_ratio && !self.critical_warned.swap(true, Ordering::Relaxed) {
            warn!("memory usage ratio {:.2} exceeds critical overload ratio", ratio);
        } else if ratio <= self.config.critical_overload_ratio {
            self.critical_warned.store(false, Ordering::Relaxed);
        }

        let snapshot = MemorySnapshot {
            created_at: now_millis(),
            total_bytes,
            used_bytes: numerator,
            free_bytes: total_bytes.saturating_sub(numerator),
            main_process_bytes,
            child_processes_bytes,
            is_overloaded,
        };

        let mut history = self.memory.lock().await;
        history.samples.push_back(snapshot);
        self.prune(&mut history.samples, self.config.snapshot_history);
    }

    async fn sample_event_loop(&self) {
        let start = Instant::now();
        tokio::task::yield_now().await;
        let observed = start.elapsed();
        let max_blocked = Duration::from_millis(self.config.max_blocked_millis);
        let exceeded_millis = observed.saturating_sub(max_blocked).as_millis() as u64;
        let is_overloaded = observed > max_blocked;

        let snapshot = EventLoopSnapshot {
            created_at: now_millis(),
            exceeded_millis,
            is_overloaded,
        };

        let mut history = self.event_loop.lock().await;
        history.samples.push_back(snapshot);
        self.prune(&mut history.samples, self.config.snapshot_history);
    }

    async fn sample_client(&self, last_count: u64) -> u64 {
        let current = self.client_error_count.load(Ordering::Relaxed);
        let delta = current.saturating_sub(last_count);
        let is_overloaded = delta > self.config.max_client_errors;

        let snapshot = ClientSnapshot {
            created_at: now_millis(),
            rate_limit_error_count: current,
            is_overloaded,
        };

        let mut history = self.client.lock().await;
        history.samples.push_back(snapshot);
        self.prune(&mut history.samples, self.config.snapshot_history);
        current
    }

    fn prune<T: Copy + SnapshotTime>(&self, samples: &mut VecDeque<T>, retention: Duration) {
        let cutoff = now_millis().saturating_sub(retention.as_millis() as u64);
        while let Some(front) = samples.front() {
            if front.created_at_millis() < cutoff {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub async fn get_memory_sample(&self, duration_millis: Option<u64>) -> Vec<MemorySnapshot> {
        Self::windowed(&self.memory.lock().await.samples, duration_millis)
    }

    pub async fn get_event_loop_sample(&self, duration_millis: Option<u64>) -> Vec<EventLoopSnapshot> {
        Self::windowed(&self.event_loop.lock().await.samples, duration_millis)
    }

    pub async fn get_cpu_sample(&self, duration_millis: Option<u64>) -> Vec<CpuSnapshot> {
        Self::windowed(&self.cpu.lock().await.samples, duration_millis)
    }

    pub async fn get_client_sample(&self, duration_millis: Option<u64>) -> Vec<ClientSnapshot> {
        Self::windowed(&self.client.lock().await.samples, duration_millis)
    }

    fn windowed<T: Copy + SnapshotTime>(samples: &VecDeque<T>, duration_millis: Option<u64>) -> Vec<T> {
        match duration_millis {
            None => samples.iter().copied().collect(),
            Some(window) => {
                let cutoff = now_millis().saturating_sub(window);
                samples.iter().copied().filter(|s| s.created_at_millis() >= cutoff).collect()
            }
        }
    }
}

trait SnapshotTime {
    fn created_at_millis(&self) -> u64;
}

impl SnapshotTime for MemorySnapshot {
    fn created_at_millis(&self) -> u64 {
        self.created_at
    }
}
impl SnapshotTime for EventLoopSnapshot {
    fn created_at_millis(&self) -> u64 {
        self.created_at
    }
}
impl SnapshotTime for CpuSnapshot {
    fn created_at_millis(&self) -> u64 {
        self.created_at
    }
}
impl SnapshotTime for ClientSnapshot {
    fn created_at_millis(&self) -> u64 {
        self.created_at
    }
}

fn read_proc_self_rss() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SnapshotterConfig {
        SnapshotterConfig {
            memory_snapshot_interval: Duration::from_millis(10),
            event_loop_snapshot_interval: Duration::from_millis(10),
            client_snapshot_interval: Duration::from_millis(10),
            snapshot_history: Duration::from_secs(60),
            max_used_memory_ratio: 0.7,
            ignore_main_process: false,
            critical_overload_ratio: 0.9,
            max_blocked_millis: 50,
            max_client_errors: 3,
            memory_mbytes: None,
        }
    }

    #[tokio::test]
    async fn test_memory_sample_collected() {
        let snapshotter = Arc::new(Snapshotter::new(config(), EventBus::default()));
        snapshotter.sample_memory().await;
        let samples = snapshotter.get_memory_sample(None).await;
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_mbytes_override_sets_total() {
        let mut cfg = config();
        cfg.memory_mbytes = Some(512);
        let snapshotter = Arc::new(Snapshotter::new(cfg, EventBus::default()));
        snapshotter.sample_memory().await;
        let samples = snapshotter.get_memory_sample(None).await;
        assert_eq!(samples[0].total_bytes, 512 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_client_overload_triggers_past_threshold() {
        let snapshotter = Arc::new(Snapshotter::new(config(), EventBus::default()));
        for _ in 0..5 {
            snapshotter.record_client_error();
        }
        let last = snapshotter.sample_client(0).await;
        assert_eq!(last, 5);
        let samples = snapshotter.get_client_sample(None).await;
        assert!(samples[0].is_overloaded);
    }

    #[tokio::test]
    async fn test_client_not_overloaded_under_threshold() {
        let snapshotter = Arc::new(Snapshotter::new(config(), EventBus::default()));
        snapshotter.record_client_error();
        let last = snapshotter.sample_client(0).await;
        assert_eq!(last, 1);
        let samples = snapshotter.get_client_sample(None).await;
        assert!(!samples[0].is_overloaded);
    }

    #[tokio::test]
    async fn test_cpu_sample_via_event_bus() {
        let bus = EventBus::new(16);
        let snapshotter = Arc::new(Snapshotter::new(config(), bus.clone()));
        snapshotter.start().await;
        bus.publish(CrawlEvent::CpuOverloaded { is_overloaded: true, created_at: now_millis() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let samples = snapshotter.get_cpu_sample(None).await;
        assert!(!samples.is_empty());
        snapshotter.stop().await;
    }

    #[tokio::test]
    async fn test_windowed_sample_excludes_old_entries() {
        let snapshotter = Arc::new(Snapshotter::new(config(), EventBus::default()));
        {
            let mut history = snapshotter.memory.lock().await;
            history.samples.push_back(MemorySnapshot {
                created_at: now_millis().saturating_sub(100_000),
                total_bytes: 100,
                used_bytes: 10,
                free_bytes: 90,
                main_process_bytes: 10,
                child_processes_bytes: 0,
                is_overloaded: false,
            });
        }
        snapshotter.sample_memory().await;
        let recent = snapshotter.get_memory_sample(Some(1_000)).await;
        assert_eq!(recent.len(), 1);
    }
}
