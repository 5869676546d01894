//! Cross-module integration tests exercising the crawl pipeline end to
//! end, rather than duplicating the per-module unit tests already living
//! alongside each subsystem.

#[cfg(test)]
mod integration_tests {
    use crate::autoscaled_pool::{AutoscaledPool, PoolTasks};
    use crate::config::{AutoscaledPoolConfig, Config, RequestQueueConfig, SessionPoolConfig, SnapshotterConfig, SystemStatusConfig};
    use crate::events::EventBus;
    use crate::request::{Method, Request};
    use crate::request_queue::RequestQueue;
    use crate::session_pool::SessionPool;
    use crate::snapshotter::Snapshotter;
    use crate::storage::InMemoryStorageClient;
    use crate::system_status::SystemStatus;
    use crate::error::CrawlError;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.default_request_queue_id, "default");
        assert!(config.local_storage_dir.is_none());
        assert_eq!(config.autoscaled_pool.min_concurrency, 1);
        assert_eq!(config.session_pool.max_pool_size, 1000);
    }

    /// A queue drained by a single `SessionPool`-backed worker loop should
    /// end up with every request handled exactly once, regardless of
    /// whether a request hit a transient failure and was reclaimed.
    #[tokio::test]
    async fn test_queue_and_session_pool_drain_together() {
        let queue = Arc::new(RequestQueue::new(
            "it-queue",
            RequestQueueConfig {
                storage_consistency_delay: Duration::from_millis(0),
                api_processed_requests_delay: Duration::from_millis(0),
                ..RequestQueueConfig::default()
            },
            Arc::new(InMemoryStorageClient::new()),
        ));
        let session_pool = Arc::new(SessionPool::new(
            SessionPoolConfig { max_pool_size: 2, ..SessionPoolConfig::default() },
            EventBus::default(),
        ));

        for i in 0..6 {
            let req = Request::new(&format!("https://example.com/{i}"), Method::Get, false).unwrap();
            queue.add_request(req, false).await.unwrap();
        }

        let mut handled = 0;
        while let Some(request) = queue.fetch_next_request().await.unwrap() {
            let session = session_pool.get_session().await.unwrap();
            session_pool.mark_good(&session.id).await;
            queue.mark_request_handled(request).await.unwrap();
            handled += 1;
        }

        assert_eq!(handled, 6);
        assert!(queue.is_finished().await.unwrap());
        assert_eq!(queue.get_info().assumed_total_count, 6);
        assert!(session_pool.size().await <= 2);
    }

    /// A fetched-but-not-yet-handled request reclaimed to the forefront is
    /// served again before the queue reports finished, matching the retry
    /// path `Crawler::run_task` relies on for transient failures.
    #[tokio::test]
    async fn test_reclaimed_request_is_refetched_before_finishing() {
        let queue = RequestQueue::new(
            "it-retry",
            RequestQueueConfig { storage_consistency_delay: Duration::from_millis(0), ..RequestQueueConfig::default() },
            Arc::new(InMemoryStorageClient::new()),
        );

        let req = Request::new("https://example.com/flaky", Method::Get, false).unwrap();
        queue.add_request(req, false).await.unwrap();

        let first_attempt = queue.fetch_next_request().await.unwrap().unwrap();
        assert!(!queue.is_finished().await.unwrap());
        queue.reclaim_request(first_attempt, true).await.unwrap();

        let second_attempt = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(second_attempt.url, "https://example.com/flaky");
        queue.mark_request_handled(second_attempt).await.unwrap();

        assert!(queue.is_finished().await.unwrap());
        assert_eq!(queue.handled_count(), 1);
    }

    /// `SystemStatus::is_system_idle` should flip once enough memory
    /// samples exceed `max_used_memory_ratio`, and an `AutoscaledPool`
    /// built on that status should still run every ready task to
    /// completion even while overloaded (it only throttles scale-up).
    #[tokio::test]
    async fn test_autoscaled_pool_completes_under_system_status() {
        let snapshotter = Arc::new(Snapshotter::new(
            SnapshotterConfig { memory_snapshot_interval: Duration::from_millis(5), ..SnapshotterConfig::default() },
            EventBus::default(),
        ));
        let system_status = Arc::new(SystemStatus::new(SystemStatusConfig::default(), snapshotter));

        let pool_config = AutoscaledPoolConfig {
            min_concurrency: 1,
            max_concurrency: 4,
            desired_concurrency: 2,
            maybe_run_interval: Duration::from_millis(5),
            scale_up_interval: Duration::from_secs(3600),
            scale_down_interval: Duration::from_secs(3600),
            scale_up_step_ratio: 0.5,
            scale_down_step_ratio: 0.5,
        };

        let tasks = Arc::new(CountingTasks { remaining: AtomicUsize::new(20), ran: Arc::new(AtomicUsize::new(0)) });
        let pool = Arc::new(AutoscaledPool::new(pool_config, system_status, tasks.clone()));

        let result = tokio::time::timeout(Duration::from_secs(5), pool.run()).await;
        assert!(result.is_ok());
        assert!(tasks.ran.load(Ordering::Relaxed) >= 20);
    }

    struct CountingTasks {
        remaining: AtomicUsize,
        ran: Arc<AtomicUsize>,
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

    /// A `SessionPool` restored from persisted state should preserve a
    /// session's accumulated error score the way a restarted crawl
    /// process would, keeping a badly-behaved session unusable.
    #[tokio::test]
    async fn test_session_pool_state_round_trip_after_bad_sessions() {
        let pool = SessionPool::new(SessionPoolConfig { max_pool_size: 3, ..SessionPoolConfig::default() }, EventBus::default());
        let a = pool.get_session().await.unwrap();
        let _b = pool.get_session().await.unwrap();
        for _ in 0..7 {
            pool.mark_bad(&a.id).await;
        }

        let state = pool.get_state().await;
        let restored = SessionPool::new(SessionPoolConfig { max_pool_size: 3, ..SessionPoolConfig::default() }, EventBus::default());
        restored.initialize(Some(state)).await;

        assert_eq!(restored.size().await, 2);
        assert!(restored.usable_count().await <= 1);
    }

    /// A `RequestQueue` marked as shared by multiple clients must not
    /// trust an empty head until the consistency wait elapses.
    #[tokio::test]
    async fn test_multi_client_queue_requires_consistency_wait_before_finishing() {
        let storage = Arc::new(InMemoryStorageClient::new());
        let cfg = RequestQueueConfig {
            storage_consistency_delay: Duration::from_millis(0),
            api_processed_requests_delay: Duration::from_millis(30),
            ..RequestQueueConfig::default()
        };
        let queue_a = RequestQueue::new("shared", cfg.clone(), storage.clone());
        queue_a.set_had_multiple_clients(true);

        let req = Request::new("https://example.com/shared", Method::Get, false).unwrap();
        queue_a.add_request(req, false).await.unwrap();
        let fetched = queue_a.fetch_next_request().await.unwrap().unwrap();
        queue_a.mark_request_handled(fetched).await.unwrap();

        assert!(queue_a.is_empty().await.unwrap());
        assert!(!queue_a.is_finished().await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(queue_a.is_finished().await.unwrap());
    }
}
