//! `SystemStatus`: reduces `Snapshotter` histories into a single
//! overloaded/not-overloaded verdict per dimension, and an overall verdict.

use crate::config::SystemStatusConfig;
use crate::snapshotter::Snapshotter;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusResult {
    pub is_system_idle: bool,
    pub mem_info: DimensionResult,
    pub event_loop_info: DimensionResult,
    pub cpu_info: DimensionResult,
    pub client_info: DimensionResult,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimensionResult {
    pub is_overloaded: bool,
    pub overloaded_ratio: f64,
    pub samples_count: usize,
}

pub struct SystemStatus {
    config: SystemStatusConfig,
    snapshotter: Arc<Snapshotter>,
}

impl SystemStatus {
    pub fn new(config: SystemStatusConfig, snapshotter: Arc<Snapshotter>) -> Self {
        Self { config, snapshotter }
    }

    pub async fn get_current_status(&self) -> StatusResult {
        self.get_status(Some(self.config.current_history.as_millis() as u64)).await
    }

    pub async fn get_historical_status(&self) -> StatusResult {
        self.get_status(None).await
    }

    async fn get_status(&self, window_millis: Option<u64>) -> StatusResult {
        let memory = self.snapshotter.get_memory_sample(window_millis).await;
        let event_loop = self.snapshotter.get_event_loop_sample(window_millis).await;
        let cpu = self.snapshotter.get_cpu_sample(window_millis).await;
        let client = self.snapshotter.get_client_sample(window_millis).await;

        let mem_info = Self::dimension(
            memory.len(),
            memory.iter().filter(|s| s.is_overloaded).count(),
            self.config.max_memory_overloaded_ratio,
        );
        let event_loop_info = Self::dimension(
            event_loop.len(),
            event_loop.iter().filter(|s| s.is_overloaded).count(),
            self.config.max_event_loop_overloaded_ratio,
        );
        let cpu_info = Self::dimension(
            cpu.len(),
            cpu.iter().filter(|s| s.is_overloaded).count(),
            self.config.max_cpu_overloaded_ratio,
        );
        let client_info = Self::dimension(
            client.len(),
            client.iter().filter(|s| s.is_overloaded).count(),
            self.config.max_client_overloaded_ratio,
        );

        let is_system_idle = !mem_info.is_overloaded
            && !event_loop_info.is_overloaded
            && !cpu_info.is_overloaded
            && !client_info.is_overloaded;

        StatusResult { is_system_idle, mem_info, event_loop_info, cpu_info, client_info }
    }

    /// A dimension with no samples is never overloaded: there's nothing to
    /// judge it against, so it defaults to idle rather than blocking scaling.
    fn dimension(total: usize, overloaded: usize, max_ratio: f64) -> DimensionResult {
        if total == 0 {
            return DimensionResult { is_overloaded: false, overloaded_ratio: 0.0, samples_count: 0 };
        }
        let ratio = overloaded as f64 / total as f64;
        DimensionResult { is_overloaded: ratio > max_ratio, overloaded_ratio: ratio, samples_count: total }
    }
}
