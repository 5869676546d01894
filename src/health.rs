//! System health reporting: reduces `SystemStatus`, `SessionPool`, and
//! `RequestQueue` state into a three-level verdict, with a rolling alert
//! log and a periodic monitor task — the operational surface an operator
//! or orchestrator polls to decide whether to keep scaling up.

use crate::request_queue::RequestQueue;
use crate::session_pool::SessionPool;
use crate::system_status::SystemStatus;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub resources: HealthLevel,
    pub sessions: HealthLevel,
    pub queue: HealthLevel,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Minimum fraction of the session pool that must be usable.
    pub min_usable_session_ratio: f64,
    /// Queue backlog (assumed total - handled) above which the queue is
    /// considered under strain.
    pub max_queue_backlog: usize,
    pub critical_queue_backlog: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_usable_session_ratio: 0.2,
            max_queue_backlog: 10_000,
            critical_queue_backlog: 100_000,
        }
    }
}

pub struct CrawlHealthChecker {
    system_status: Arc<SystemStatus>,
    session_pool: Arc<SessionPool>,
    queue: Arc<RequestQueue>,
    thresholds: HealthThresholds,
}

impl CrawlHealthChecker {
    pub fn new(system_status: Arc<SystemStatus>, session_pool: Arc<SessionPool>, queue: Arc<RequestQueue>) -> Self {
        Self { system_status, session_pool, queue, thresholds: HealthThresholds::default() }
    }

    pub async fn check_system_health(&self) -> HealthStatus {
        let resources = self.check_resource_health().await;
        let sessions = self.check_session_health().await;
        let queue = self.check_queue_health().await;

        let overall = Self::worst_of(&[resources.clone(), sessions.clone(), queue.clone()]);

        HealthStatus { overall, resources, sessions, queue, timestamp: SystemTime::now() }
    }

    async fn check_resource_health(&self) -> HealthLevel {
        let status = self.system_status.get_current_status().await;
        if !status.is_system_idle
            && (status.mem_info.is_overloaded || status.event_loop_info.is_overloaded)
        {
            warn!("resource health degraded: memory or event loop overloaded");
            return HealthLevel::Warning;
        }
        if status.cpu_info.is_overloaded && status.client_info.is_overloaded {
            error!("resource health critical: CPU and upstream client both overloaded");
            return HealthLevel::Critical;
        }
        HealthLevel::Healthy
    }

    async fn check_session_health(&self) -> HealthLevel {
        let size = self.session_pool.size().await;
        if size == 0 {
            return HealthLevel::Healthy;
        }
        let usable = self.session_pool.usable_count().await;
        let ratio = usable as f64 / size as f64;

        if ratio == 0.0 {
            error!("session pool health critical: no usable sessions out of {size}");
            HealthLevel::Critical
        } else if ratio < self.thresholds.min_usable_session_ratio {
            warn!("session pool health warning: usable ratio {:.2}", ratio);
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    async fn check_queue_health(&self) -> HealthLevel {
        let info = self.queue.get_info();
        let backlog = info.assumed_total_count.saturating_sub(info.assumed_handled_count);

        if backlog > self.thresholds.critical_queue_backlog {
            error!("queue health critical: backlog {backlog}");
            HealthLevel::Critical
        } else if backlog > self.thresholds.max_queue_backlog {
            warn!("queue health warning: backlog {backlog}");
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn worst_of(levels: &[HealthLevel]) -> HealthLevel {
        if levels.contains(&HealthLevel::Critical) {
            HealthLevel::Critical
        } else if levels.contains(&HealthLevel::Warning) {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Clone)]
pub enum AlertType {
    Critical,
    ResourceExhaustion,
    SessionPoolDegraded,
    QueueBacklog,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::Critical => write!(f, "CRITICAL"),
            AlertType::ResourceExhaustion => write!(f, "RESOURCE_EXHAUSTION"),
            AlertType::SessionPoolDegraded => write!(f, "SESSION_POOL_DEGRADED"),
            AlertType::QueueBacklog => write!(f, "QUEUE_BACKLOG"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthAlert {
    pub id: String,
    pub alert_type: AlertType,
    pub message: String,
    pub timestamp: SystemTime,
    pub acknowledged: bool,
}

pub struct HealthMonitor {
    checker: CrawlHealthChecker,
    alerts: Vec<HealthAlert>,
}

impl HealthMonitor {
    pub fn new(checker: CrawlHealthChecker) -> Self {
        Self { checker, alerts: Vec::new() }
    }

    pub async fn start_monitoring(&mut self, interval: Duration) {
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            let status = self.checker.check_system_health().await;
            self.check_alerts(&status);
            self.cleanup_old_alerts();
        }
    }

    fn check_alerts(&mut self, status: &HealthStatus) {
        if status.overall == HealthLevel::Critical {
            self.create_alert(AlertType::Critical, "system health is critical".to_string());
        }
        if status.resources == HealthLevel::Critical {
            self.create_alert(AlertType::ResourceExhaustion, "resource usage is critical".to_string());
        }
        if status.sessions == HealthLevel::Critical {
            self.create_alert(AlertType::SessionPoolDegraded, "session pool has no usable sessions".to_string());
        }
        if status.queue == HealthLevel::Critical {
            self.create_alert(AlertType::QueueBacklog, "queue backlog is critical".to_string());
        }
    }

    fn create_alert(&mut self, alert_type: AlertType, message: String) {
        let alert = HealthAlert {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            message,
            timestamp: SystemTime::now(),
            acknowledged: false,
        };
        error!("health alert [{}]: {}", alert.alert_type, alert.message);
        self.alerts.push(alert);
    }

    fn cleanup_old_alerts(&mut self) {
        let cutoff = SystemTime::now() - Duration::from_secs(24 * 60 * 60);
        self.alerts.retain(|alert| alert.timestamp > cutoff);
    }

    pub fn get_active_alerts(&self) -> Vec<&HealthAlert> {
        self.alerts.iter().filter(|a| !a.acknowledged).collect()
    }

    pub fn acknowledge_alert(&mut self, alert_id: &str) {
        if let Some(alert) = self.alerts.iter_mut().find(|a| a.id == alert_id) {
            alert.acknowledged = true;
            info!("alert {alert_id} acknowledged");
        }
    }
}

pub struct HealthEndpoint {
    monitor: Arc<tokio::sync::Mutex<HealthMonitor>>,
}

impl HealthEndpoint {
    pub fn new(monitor: HealthMonitor) -> Self {
        Self { monitor: Arc::new(tokio::sync::Mutex::new(monitor)) }
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let monitor = self.monitor.lock().await;
        monitor.checker.check_system_health().await
    }

    pub async fn get_alerts(&self) -> Vec<HealthAlert> {
        let monitor = self.monitor.lock().await;
        monitor.get_active_alerts().into_iter().cloned().collect()
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) {
        let mut monitor = self.monitor.lock().await;
        monitor.acknowledge_alert(alert_id);
    }
}
