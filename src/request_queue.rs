//! `RequestQueue`: the mutable, restartable crawl frontier backed by a
//! `RemoteStorageClient`. Keeps a small local cache of the queue head so
//! `fetch_next_request` doesn't round-trip to the backend on every call,
//! and tracks in-progress/recently-handled ids to make `reclaim_request`
//! and `is_finished` correct under concurrent access from many workers.

use crate::config::RequestQueueConfig;
use crate::error::CrawlError;
use crate::request::{QueueOperationInfo, Request};
use crate::storage::RemoteStorageClient;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct RequestQueueInfo {
    pub assumed_total_count: usize,
    pub assumed_handled_count: usize,
    pub had_multiple_clients: bool,
}

struct QueueHead {
    /// Pending ids known locally, in fetch order. Maps id -> order_no so
    /// reclaimed requests can be reinserted at the correct end.
    dict: IndexMap<String, i64>,
    queried_at: Instant,
    /// The backend's own `queueModifiedAt`, as of the last head refresh —
    /// used by `is_finished` instead of this instance's local clock, so a
    /// write from another client is visible even though this queue never
    /// made it itself.
    queue_modified_at: u64,
}

pub struct RequestQueue {
    queue_id: String,
    /// Identifies this queue instance to the backend so it can tell whether
    /// more than one client has accessed the same queue.
    client_id: String,
    config: RequestQueueConfig,
    storage: Arc<dyn RemoteStorageClient>,
    head: Mutex<QueueHead>,
    in_progress: Mutex<HashSet<String>>,
    recently_handled: Mutex<IndexMap<String, ()>>,
    requests_cache: Mutex<IndexMap<String, Request>>,
    assumed_total_count: AtomicUsize,
    assumed_handled_count: AtomicUsize,
    had_multiple_clients: AtomicBool,
}

impl RequestQueue {
    pub fn new(queue_id: impl Into<String>, config: RequestQueueConfig, storage: Arc<dyn RemoteStorageClient>) -> Self {
        Self {
            queue_id: queue_id.into(),
            client_id: Uuid::new_v4().to_string(),
            config,
            storage,
            head: Mutex::new(QueueHead { dict: IndexMap::new(), queried_at: Instant::now(), queue_modified_at: 0 }),
            in_progress: Mutex::new(HashSet::new()),
            recently_handled: Mutex::new(IndexMap::new()),
            requests_cache: Mutex::new(IndexMap::new()),
            assumed_total_count: AtomicUsize::new(0),
            assumed_handled_count: AtomicUsize::new(0),
            had_multiple_clients: AtomicBool::new(false),
        }
    }

    /// Marks that more than one worker process is sharing this queue,
    /// relaxing the extra consistency wait `is_finished` otherwise applies.
    pub fn set_had_multiple_clients(&self, value: bool) {
        self.had_multiple_clients.store(value, Ordering::Relaxed);
    }

    pub async fn add_request(&self, request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError> {
        let info = self.storage.add_request(&self.queue_id, request, forefront).await?;

        if !info.was_already_present {
            self.assumed_total_count.fetch_add(1, Ordering::Relaxed);
        }
        if !info.was_already_handled {
            self.cache_put(&info).await;
            let mut head = self.head.lock().await;
            if forefront {
                head.dict.shift_insert(0, info.request_id.clone(), 0);
            } else {
                head.dict.insert(info.request_id.clone(), 0);
            }
        }

        Ok(info)
    }

    async fn cache_put(&self, info: &QueueOperationInfo) {
        let mut cache = self.requests_cache.lock().await;
        cache.insert(info.request_id.clone(), info.request.clone());
        while cache.len() > self.config.cache_capacity {
            cache.shift_remove_index(0);
        }
    }

    pub async fn get_request(&self, request_id: &str) -> Result<Option<Request>, CrawlError> {
        if let Some(request) = self.requests_cache.lock().await.get(request_id) {
            return Ok(Some(request.clone()));
        }
        self.storage.get_request(&self.queue_id, request_id).await
    }

    /// Refreshes the local head cache from the backend when it's empty or
    /// stale, skipping ids already in progress or recently handled.
    async fn ensure_head_fresh(&self) -> Result<(), CrawlError> {
        let needs_refresh = {
            let head = self.head.lock().await;
            head.dict.is_empty() || head.queried_at.elapsed() > self.config.storage_consistency_delay
        };
        if !needs_refresh {
            return Ok(());
        }

        let limit = self.config.query_head_min_length + self.config.query_head_buffer_length;
        let result = self.storage.get_head(&self.queue_id, limit, &self.client_id).await?;

        if result.had_multiple_clients {
            self.had_multiple_clients.store(true, Ordering::Relaxed);
        }

        let in_progress = self.in_progress.lock().await;
        let recently_handled = self.recently_handled.lock().await;
        let mut head = self.head.lock().await;

        for request in result.items {
            let Some(id) = request.id.clone() else { continue };
            if in_progress.contains(&id) || recently_handled.contains_key(&id) {
                continue;
            }
            head.dict.entry(id.clone()).or_insert(0);
            self.requests_cache.lock().await.insert(id, request);
        }
        head.queried_at = Instant::now();
        head.queue_modified_at = result.queue_modified_at;
        Ok(())
    }

    /// Pops one id off the local head cache and resolves it to a `Request`.
    /// If the backend can't provide the popped id (a momentary consistency
    /// lag between the head listing and `getRequest`), the id is dropped
    /// without ever being marked in-progress — returning it here would strand
    /// it forever, since no caller would ever hold it to hand back via
    /// `mark_request_handled`/`reclaim_request`.
    async fn try_pop_and_fetch(&self) -> Result<Option<Request>, CrawlError> {
        let id = {
            let mut head = self.head.lock().await;
            match head.dict.shift_remove_index(0) {
                Some((id, _)) => id,
                None => return Ok(None),
            }
        };

        match self.get_request(&id).await? {
            Some(request) => {
                self.in_progress.lock().await.insert(id);
                Ok(Some(request))
            }
            None => {
                warn!("head referenced id '{id}' that getRequest could not provide; treating as a transient miss");
                tokio::time::sleep(self.config.storage_consistency_delay).await;
                self.ensure_head_fresh().await?;
                Ok(None)
            }
        }
    }

    pub async fn fetch_next_request(&self) -> Result<Option<Request>, CrawlError> {
        self.ensure_head_fresh().await?;
        if let Some(request) = self.try_pop_and_fetch().await? {
            return Ok(Some(request));
        }
        // A transient miss already slept and refreshed the head; give the
        // backend one more chance to serve a request before reporting empty.
        self.try_pop_and_fetch().await
    }

    pub async fn mark_request_handled(&self, request: Request) -> Result<QueueOperationInfo, CrawlError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CrawlError::InvalidInput("mark_request_handled requires an assigned id".to_string()))?;

        if !self.in_progress.lock().await.remove(&id) {
            return Err(CrawlError::StateMismatch(format!("request '{id}' is not in progress")));
        }

        let info = self.storage.mark_request_handled(&self.queue_id, request).await?;
        self.assumed_handled_count.fetch_add(1, Ordering::Relaxed);

        let mut recently_handled = self.recently_handled.lock().await;
        recently_handled.insert(id, ());
        while recently_handled.len() > self.config.cache_capacity {
            recently_handled.shift_remove_index(0);
        }

        Ok(info)
    }

    /// Returns an in-progress request to the head so it is fetched again.
    /// Stays in `in_progress` for `storage_consistency_delay` after the
    /// backend write before reappearing in the head cache, guarding against
    /// a stale head read that would otherwise re-dispatch it a second time
    /// while the update is still propagating.
    pub async fn reclaim_request(&self, request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CrawlError::InvalidInput("reclaim_request requires an assigned id".to_string()))?;

        if !self.in_progress.lock().await.contains(&id) {
            return Err(CrawlError::StateMismatch(format!("request '{id}' is not in progress")));
        }

        let info = self.storage.update_request(&self.queue_id, request, forefront).await?;
        self.cache_put(&info).await;

        tokio::time::sleep(self.config.storage_consistency_delay).await;

        self.in_progress.lock().await.remove(&id);
        let mut head = self.head.lock().await;
        if forefront {
            head.dict.shift_insert(0, id, 0);
        } else {
            head.dict.insert(id, 0);
        }

        Ok(info)
    }

    pub async fn is_empty(&self) -> Result<bool, CrawlError> {
        self.ensure_head_fresh().await?;
        let head = self.head.lock().await;
        let in_progress = self.in_progress.lock().await;
        Ok(head.dict.is_empty() && in_progress.is_empty())
    }

    /// `is_empty` plus a consistency wait: a backend with multiple writers
    /// can report an empty head briefly before a just-added request becomes
    /// visible, so this requires the backend's own `queueModifiedAt` to be
    /// at least `api_processed_requests_delay` old before trusting
    /// "finished" — using the backend's clock rather than this instance's
    /// own `queried_at` so a write from another client counts too. A queue
    /// known to have only one client skips that extra wait.
    pub async fn is_finished(&self) -> Result<bool, CrawlError> {
        if !self.is_empty().await? {
            return Ok(false);
        }

        if !self.had_multiple_clients.load(Ordering::Relaxed) {
            return Ok(true);
        }

        let queue_modified_at = self.head.lock().await.queue_modified_at;
        let modified_age = Duration::from_millis(now_millis().saturating_sub(queue_modified_at));
        Ok(modified_age >= self.config.api_processed_requests_delay)
    }

    pub fn handled_count(&self) -> usize {
        self.assumed_handled_count.load(Ordering::Relaxed)
    }

    pub fn get_info(&self) -> RequestQueueInfo {
        RequestQueueInfo {
            assumed_total_count: self.assumed_total_count.load(Ordering::Relaxed),
            assumed_handled_count: self.assumed_handled_count.load(Ordering::Relaxed),
            had_multiple_clients: self.had_multiple_clients.load(Ordering::Relaxed),
        }
    }

    pub async fn drop_queue(&self) -> Result<(), CrawlError> {
        self.storage.delete_queue(&self.queue_id).await
    }
}
