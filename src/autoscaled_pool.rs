//! `AutoscaledPool`: runs a caller-supplied task loop with concurrency that
//! adapts to `SystemStatus`, scaling up when the system is idle and tasks
//! are waiting, and down when the system is overloaded.

use crate::config::AutoscaledPoolConfig;
use crate::error::CrawlError;
use crate::system_status::{StatusResult, SystemStatus};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// The three hooks a caller supplies to drive one unit of work. `run_task`
/// returning an error aborts the whole pool, mirroring a failed task
/// propagating out of a worker loop.
pub trait PoolTasks: Send + Sync {
    fn is_task_ready<'a>(&'a self) -> BoxFuture<'a, bool>;
    fn run_task<'a>(&'a self) -> BoxFuture<'a, Result<(), CrawlError>>;
    fn is_finished<'a>(&'a self) -> BoxFuture<'a, bool>;
}

pub struct AutoscaledPool<T: PoolTasks + 'static> {
    config: AutoscaledPoolConfig,
    system_status: Arc<SystemStatus>,
    tasks: Arc<T>,
    desired_concurrency: AtomicUsize,
    running_count: Arc<AtomicUsize>,
    semaphore: Arc<Semaphore>,
    paused: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    failure: Mutex<Option<CrawlError>>,
}

impl<T: PoolTasks + 'static> AutoscaledPool<T> {
    pub fn new(config: AutoscaledPoolConfig, system_status: Arc<SystemStatus>, tasks: Arc<T>) -> Self {
        let desired = config.desired_concurrency.clamp(config.min_concurrency, config.max_concurrency);
        let semaphore = Arc::new(Semaphore::new(desired));
        Self {
            config,
            system_status,
            tasks,
            desired_concurrency: AtomicUsize::new(desired),
            running_count: Arc::new(AtomicUsize::new(0)),
            semaphore,
            paused: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
            failure: Mutex::new(None),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn desired_concurrency(&self) -> usize {
        self.desired_concurrency.load(Ordering::Relaxed)
    }

    pub fn running_count(&self) -> usize {
        self.running_count.load(Ordering::Relaxed)
    }

    /// Runs until `is_finished` reports true, the caller aborts, or a task
    /// fails. Ticks the scheduler on `maybe_run_interval`, spawning ready
    /// tasks up to the current permit count and periodically re-evaluating
    /// concurrency against `SystemStatus`.
    pub async fn run(self: Arc<Self>) -> Result<(), CrawlError> {
        let mut last_scale_up = tokio::time::Instant::now();
        let mut last_scale_down = tokio::time::Instant::now();
        let mut timer = tokio::time::interval(self.config.maybe_run_interval);

        loop {
            timer.tick().await;

            if self.aborted.load(Ordering::Relaxed) {
                return Err(CrawlError::TaskError("pool aborted".to_string()));
            }
            if let Some(err) = self.failure.lock().await.take() {
                return Err(err);
            }
            if self.tasks.is_finished().await && self.running_count() == 0 {
                return Ok(());
            }
            if self.paused.load(Ordering::Relaxed) {
                continue;
            }

            let historical = self.maybe_scale(&mut last_scale_up, &mut last_scale_down).await;
            self.spawn_ready_tasks(&historical);
        }
    }

    /// Scale-up reacts to the current (short-window) status so a burst of
    /// idle capacity is used quickly; scale-down reacts to the historical
    /// (full-window) status so one brief idle blip doesn't immediately give
    /// back capacity the system has been using all along. Returns the
    /// historical status so `spawn_ready_tasks` can reuse it as the spawn
    /// precondition without a second snapshotter query this tick.
    async fn maybe_scale(&self, last_scale_up: &mut tokio::time::Instant, last_scale_down: &mut tokio::time::Instant) -> StatusResult {
        let current_status = self.system_status.get_current_status().await;
        let historical_status = self.system_status.get_historical_status().await;
        let current = self.desired_concurrency();

        if current_status.is_system_idle && last_scale_up.elapsed() >= self.config.scale_up_interval {
            let step = ((current as f64) * self.config.scale_up_step_ratio).ceil() as usize;
            let next = (current + step.max(1)).min(self.config.max_concurrency);
            if next > current {
                self.add_permits(next - current);
                self.desired_concurrency.store(next, Ordering::Relaxed);
                debug!("scaled up from {current} to {next}");
            }
            *last_scale_up = tokio::time::Instant::now();
        } else if !historical_status.is_system_idle && last_scale_down.elapsed() >= self.config.scale_down_interval {
            let step = ((current as f64) * self.config.scale_down_step_ratio).floor() as usize;
            let next = current.saturating_sub(step.max(1)).max(self.config.min_concurrency);
            if next < current {
                self.remove_permits(current - next);
                self.desired_concurrency.store(next, Ordering::Relaxed);
                debug!("scaled down from {current} to {next}");
            }
            *last_scale_down = tokio::time::Instant::now();
        }

        historical_status
    }

    fn add_permits(&self, count: usize) {
        self.semaphore.add_permits(count);
    }

    /// Semaphore has no direct permit removal; we let outstanding permits
    /// drain naturally and simply stop handing new ones out until the
    /// running count falls back under the new desired concurrency.
    fn remove_permits(&self, _count: usize) {}

    /// Spawns new tasks only while the system is not historically
    /// overloaded; an already-running task is left to finish regardless, but
    /// no new one is started until the overload signal clears.
    fn spawn_ready_tasks(self: &Arc<Self>, historical_status: &StatusResult) {
        if !historical_status.is_system_idle {
            debug!("system overloaded (historical); not spawning new tasks this tick");
            return;
        }

        while self.running_count() < self.desired_concurrency() {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else { break };
            let this = self.clone();
            self.running_count.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                let _permit = permit;
                if !this.tasks.is_task_ready().await {
                    this.running_count.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                if let Err(err) = this.tasks.run_task().await {
                    warn!("autoscaled pool task failed: {err}");
                    *this.failure.lock().await = Some(err);
                }
                this.running_count.fetch_sub(1, Ordering::Relaxed);
            });

            // try_acquire_owned only ever hands out permits up to the current
            // semaphore capacity, so this loop terminates once they're spent.
            if self.semaphore.available_permits() == 0 {
                break;
            }
        }
        info!(running = self.running_count(), desired = self.desired_concurrency(), "pool tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemStatusConfig;
    use crate::events::EventBus;
    use crate::snapshotter::Snapshotter;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::time::Duration;

    struct CountingTasks {
        remaining: Counter,
        ran: Arc<Counter>,
    }

    impl PoolTasks for CountingTasks {
        fn is_task_ready<'a>(&'a self) -> BoxFuture<'a, bool> {
            Box::pin(async move { self.remaining.load(Ordering::Relaxed) > 0 })
        }

        fn run_task<'a>(&'a self) -> BoxFuture<'a, Result<(), CrawlError>> {
            Box::pin(async move {
                if self.remaining.fetch_sub(1, Ordering::Relaxed) == 0 {
                    self.remaining.store(0, Ordering::Relaxed);
                    return Ok(());
                }
                self.ran.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        }

        fn is_finished<'a>(&'a self) -> BoxFuture<'a, bool> {
            Box::pin(async move { self.remaining.load(Ordering::Relaxed) == 0 })
        }
    }

    fn pool_config() -> AutoscaledPoolConfig {
        AutoscaledPoolConfig {
            min_concurrency: 1,
            max_concurrency: 10,
            desired_concurrency: 2,
            maybe_run_interval: Duration::from_millis(5),
            scale_up_interval: Duration::from_secs(3600),
            scale_down_interval: Duration::from_secs(3600),
            scale_up_step_ratio: 0.5,
            scale_down_step_ratio: 0.5,
        }
    }

    async fn system_status() -> Arc<SystemStatus> {
        let snapshotter = Arc::new(Snapshotter::new(Default::default(), EventBus::default()));
        Arc::new(SystemStatus::new(SystemStatusConfig::default(), snapshotter))
    }

    #[tokio::test]
    async fn test_pool_runs_all_ready_tasks_to_completion() {
        let ran = Arc::new(Counter::new(0));
        let tasks = Arc::new(CountingTasks { remaining: Counter::new(5), ran: ran.clone() });
        let pool = Arc::new(AutoscaledPool::new(pool_config(), system_status().await, tasks));

        let result = tokio::time::timeout(Duration::from_secs(5), pool.run()).await;
        assert!(result.is_ok());
        assert!(ran.load(Ordering::Relaxed) >= 5);
    }

    #[tokio::test]
    async fn test_abort_stops_the_pool() {
        let tasks = Arc::new(CountingTasks { remaining: Counter::new(1_000_000), ran: Arc::new(Counter::new(0)) });
        let pool = Arc::new(AutoscaledPool::new(pool_config(), system_status().await, tasks));

        let pool_clone = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pool_clone.abort();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), pool.run()).await.unwrap();
        assert!(result.is_err());
    }
}
