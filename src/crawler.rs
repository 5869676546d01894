//! `Crawler`: wires `RequestQueue`, `SessionPool`, `Snapshotter`,
//! `SystemStatus`, and `AutoscaledPool` into a runnable whole — the
//! orchestrator the CLI's `run` subcommand drives.

use crate::autoscaled_pool::{AutoscaledPool, PoolTasks};
use crate::config::Config;
use crate::error::CrawlError;
use crate::events::{spawn_persist_state_ticker, CrawlEvent, EventBus};
use crate::metrics::Metrics;
use crate::request::Request;
use crate::request_queue::RequestQueue;
use crate::session_pool::{SessionPool, SessionPoolState};
use crate::snapshotter::Snapshotter;
use crate::storage::{InMemoryStorageClient, LocalFsStorageClient, RemoteStorageClient};
use crate::system_status::SystemStatus;
use crate::utils;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often the process-wide persist-state tick fires when a persist key is
/// configured. Matches the snapshotter's own default sampling cadence.
const PERSIST_STATE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Crawler {
    pub config: Config,
    pub queue: Arc<RequestQueue>,
    pub session_pool: Arc<SessionPool>,
    pub snapshotter: Arc<Snapshotter>,
    pub system_status: Arc<SystemStatus>,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
    storage: Arc<dyn RemoteStorageClient>,
    http_client: reqwest::Client,
}

impl Crawler {
    pub fn new(config: Config) -> Result<Self, CrawlError> {
        let storage: Arc<dyn RemoteStorageClient> = match &config.local_storage_dir {
            Some(dir) => Arc::new(LocalFsStorageClient::new(dir.clone())),
            None => Arc::new(InMemoryStorageClient::new()),
        };

        let events = EventBus::default();
        let queue = Arc::new(RequestQueue::new(
            config.default_request_queue_id.clone(),
            config.request_queue.clone(),
            storage.clone(),
        ));
        let session_pool = Arc::new(SessionPool::new(config.session_pool.clone(), events.clone()));
        let snapshotter_config = crate::config::SnapshotterConfig {
            memory_mbytes: config.memory_mbytes,
            ..config.snapshotter.clone()
        };
        let snapshotter = Arc::new(Snapshotter::new(snapshotter_config, events.clone()));
        let system_status = Arc::new(SystemStatus::new(config.system_status.clone(), snapshotter.clone()));

        let http_client = reqwest::Client::builder()
            .build()
            .map_err(CrawlError::from)?;

        Ok(Self {
            config,
            queue,
            session_pool,
            snapshotter,
            system_status,
            events,
            metrics: Arc::new(Metrics::new()),
            storage,
            http_client,
        })
    }

    pub async fn enqueue_url(&self, url: &str) -> Result<(), CrawlError> {
        let request = Request::new(url, crate::request::Method::Get, false)?;
        self.queue.add_request(request, false).await?;
        self.metrics.record_request_enqueued();
        Ok(())
    }

    /// Loads `SessionPool` state from the key-value store under
    /// `session_pool.persist_state_key`, if one is configured. A no-op when
    /// no key is set or the key has never been written.
    pub async fn restore_session_pool_state(&self) -> Result<(), CrawlError> {
        let Some(key) = &self.config.session_pool.persist_state_key else { return Ok(()) };
        let record = self.storage.get_record(&self.config.default_key_value_store_id, key).await?;
        let Some(bytes) = record else { return Ok(()) };
        let state: SessionPoolState = serde_json::from_slice(&bytes)?;
        self.session_pool.initialize(Some(state)).await;
        info!("restored session pool state from key '{key}'");
        Ok(())
    }

    /// Writes the current `SessionPool` state to the key-value store under
    /// `session_pool.persist_state_key`, if one is configured.
    pub async fn persist_session_pool_state(&self) -> Result<(), CrawlError> {
        let Some(key) = &self.config.session_pool.persist_state_key else { return Ok(()) };
        let state = self.session_pool.get_state().await;
        let bytes = serde_json::to_vec(&state)?;
        self.storage.set_record(&self.config.default_key_value_store_id, key, bytes).await?;
        Ok(())
    }

    /// Starts the snapshotter's periodic sampling and, when a session-pool
    /// persist key is configured, a `PersistState` ticker plus the listener
    /// that writes state out on each tick.
    pub async fn start_background_tasks(self: &Arc<Self>) {
        self.snapshotter.start().await;

        if self.config.session_pool.persist_state_key.is_some() {
            spawn_persist_state_ticker(self.events.clone(), PERSIST_STATE_INTERVAL);
            let this = self.clone();
            let mut rx = self.events.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(CrawlEvent::PersistState) => {
                            if let Err(err) = this.persist_session_pool_state().await {
                                warn!("failed to persist session pool state: {err}");
                            }
                        }
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            });
        }
    }

    /// Runs the crawl to completion through an `AutoscaledPool`, fetching
    /// each request with a rotated session and retrying transient failures
    /// up to `request_queue.max_retry_attempts` times with backoff.
    /// `desired_concurrency_override`, when set, replaces the configured
    /// `autoscaled_pool.desired_concurrency` for this run, clamped to the
    /// configured min/max bounds.
    pub async fn run(self: Arc<Self>, desired_concurrency_override: Option<usize>) -> Result<(), CrawlError> {
        let tasks = Arc::new(CrawlerTasks { crawler: self.clone() });
        let mut pool_config = self.config.autoscaled_pool.clone();
        if let Some(desired) = desired_concurrency_override {
            pool_config.desired_concurrency = desired.clamp(pool_config.min_concurrency, pool_config.max_concurrency);
        }
        let pool = Arc::new(AutoscaledPool::new(pool_config, self.system_status.clone(), tasks));
        pool.run().await
    }
}

struct CrawlerTasks {
    crawler: Arc<Crawler>,
}

impl PoolTasks for CrawlerTasks {
    fn is_task_ready<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move { !self.crawler.queue.is_empty().await.unwrap_or(false) })
    }

    fn run_task<'a>(&'a self) -> BoxFuture<'a, Result<(), CrawlError>> {
        Box::pin(async move {
            let crawler = &self.crawler;
            let Some(request) = crawler.queue.fetch_next_request().await? else {
                return Ok(());
            };
            crawler.metrics.record_request_fetched();

            let session = crawler.session_pool.get_session().await?;
            let outcome = crawler
                .http_client
                .get(&request.url)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match outcome {
                Ok(_response) => {
                    crawler.session_pool.mark_good(&session.id).await;
                    crawler.queue.mark_request_handled(request).await?;
                    crawler.metrics.record_request_handled();
                    Ok(())
                }
                Err(err) => {
                    crawler.session_pool.mark_bad(&session.id).await;
                    crawler.snapshotter.record_client_error();
                    crawler.metrics.record_request_error();

                    let mut request = request;
                    let crawl_err = CrawlError::from(err);
                    request.push_error(&crawl_err, 10);

                    if !request.no_retry
                        && request.retry_count < crawler.config.request_queue.max_retry_attempts as usize
                        && crawl_err.is_retryable()
                    {
                        request.retry_count += 1;
                        let delay = utils::backoff_delay(
                            request.retry_count as u32,
                            crawler.config.request_queue.initial_retry_delay,
                            crawler.config.request_queue.max_retry_delay,
                            crawler.config.request_queue.retry_multiplier,
                        );
                        tokio::time::sleep(delay).await;
                        crawler.queue.reclaim_request(request, false).await?;
                        crawler.metrics.record_request_reclaimed();
                    } else {
                        warn!("giving up on '{}' after {} attempts", request.url, request.retry_count);
                        crawler.queue.mark_request_handled(request).await?;
                        crawler.metrics.record_request_handled();
                    }
                    Ok(())
                }
            }
        })
    }

    fn is_finished<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.crawler.queue.is_finished().await.unwrap_or(false) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawler_builds_in_memory_backend_by_default() {
        let mut config = Config::default();
        config.local_storage_dir = None;
        let crawler = Crawler::new(config);
        assert!(crawler.is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_url_increments_queue_total() {
        let crawler = Arc::new(Crawler::new(Config::default()).unwrap());
        crawler.enqueue_url("https://example.com").await.unwrap();
        assert_eq!(crawler.queue.get_info().assumed_total_count, 1);
        info!("queued one request for test");
    }

    #[tokio::test]
    async fn test_session_pool_state_round_trips_through_persist_key() {
        let mut config = Config::default();
        config.session_pool.persist_state_key = Some("SESSION_STATE".to_string());
        let crawler = Crawler::new(config).unwrap();

        let session = crawler.session_pool.get_session().await.unwrap();
        crawler.session_pool.mark_bad(&session.id).await;
        crawler.persist_session_pool_state().await.unwrap();

        crawler.session_pool.teardown().await;
        assert_eq!(crawler.session_pool.size().await, 0);

        crawler.restore_session_pool_state().await.unwrap();
        assert_eq!(crawler.session_pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_restore_is_a_no_op_without_a_persist_key() {
        let crawler = Crawler::new(Config::default()).unwrap();
        crawler.restore_session_pool_state().await.unwrap();
        assert_eq!(crawler.session_pool.size().await, 0);
    }
}
