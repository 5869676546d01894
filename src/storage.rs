//! Storage backends behind `RequestQueue` and the key-value store: a
//! `RemoteStorageClient` trait with two implementations — an in-memory one
//! for tests and ephemeral runs, and a local-filesystem one matching the
//! on-disk layout `<LOCAL_STORAGE_DIR>/request_queues/<queueId>/...` and
//! `<LOCAL_STORAGE_DIR>/key_value_stores/<storeId>/...`.

use crate::error::CrawlError;
use crate::request::{QueueOperationInfo, Request};
use crate::utils;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// A page of the queue head plus the backend-observed metadata a
/// `RequestQueue` needs to decide `isFinished` correctly: when the queue was
/// last written (by any client) and whether more than one client has ever
/// accessed it.
#[derive(Debug, Clone)]
pub struct QueueHeadResult {
    pub items: Vec<Request>,
    pub queue_modified_at: u64,
    pub had_multiple_clients: bool,
}

#[async_trait]
pub trait RemoteStorageClient: Send + Sync {
    async fn add_request(&self, queue_id: &str, request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError>;
    async fn update_request(&self, queue_id: &str, request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError>;
    async fn mark_request_handled(&self, queue_id: &str, request: Request) -> Result<QueueOperationInfo, CrawlError>;
    async fn get_request(&self, queue_id: &str, request_id: &str) -> Result<Option<Request>, CrawlError>;
    /// `client_id` identifies the caller so the backend can tell whether the
    /// queue has ever been accessed by more than one distinct client.
    async fn get_head(&self, queue_id: &str, limit: usize, client_id: &str) -> Result<QueueHeadResult, CrawlError>;
    async fn delete_queue(&self, queue_id: &str) -> Result<(), CrawlError>;

    async fn list_keys(&self, store_id: &str) -> Result<Vec<String>, CrawlError>;
    async fn get_record(&self, store_id: &str, key: &str) -> Result<Option<Vec<u8>>, CrawlError>;
    async fn set_record(&self, store_id: &str, key: &str, value: Vec<u8>) -> Result<(), CrawlError>;
    async fn delete_record(&self, store_id: &str, key: &str) -> Result<(), CrawlError>;
}

/// Per-queue bookkeeping shared by both backends: a monotonic counter pair
/// for `orderNo` assignment (negative counts down for forefront inserts,
/// positive counts up for backfront appends), a `uniqueKey -> id` index for
/// O(1) duplicate detection, the millis timestamp of the last mutation, and
/// the set of client ids that have ever read the head.
struct QueueIndex {
    forefront_counter: AtomicI64,
    backfront_counter: AtomicI64,
    unique_key_to_id: DashMap<String, String>,
    modified_at_millis: AtomicI64,
    clients: DashSet<String>,
}

impl QueueIndex {
    fn new() -> Self {
        Self {
            forefront_counter: AtomicI64::new(-1),
            backfront_counter: AtomicI64::new(1),
            unique_key_to_id: DashMap::new(),
            modified_at_millis: AtomicI64::new(now_millis()),
            clients: DashSet::new(),
        }
    }

    fn next_order_no(&self, forefront: bool) -> i64 {
        if forefront {
            self.forefront_counter.fetch_sub(1, Ordering::SeqCst)
        } else {
            self.backfront_counter.fetch_add(1, Ordering::SeqCst)
        }
    }

    fn touch(&self) {
        self.modified_at_millis.store(now_millis(), Ordering::SeqCst);
    }

    fn note_client(&self, client_id: &str) -> bool {
        self.clients.insert(client_id.to_string());
        self.clients.len() > 1
    }
}

// ---------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------

#[derive(Clone)]
struct StoredRequest {
    order_no: i64,
    request: Request,
    handled: bool,
}

pub struct InMemoryStorageClient {
    queues: DashMap<String, DashMap<String, StoredRequest>>, // queue_id -> id -> entry
    indices: DashMap<String, QueueIndex>,
    stores: DashMap<String, DashMap<String, Vec<u8>>>, // store_id -> key -> value
}

impl InMemoryStorageClient {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            indices: DashMap::new(),
            stores: DashMap::new(),
        }
    }

    fn index_for(&self, queue_id: &str) -> dashmap::mapref::one::Ref<'_, String, QueueIndex> {
        self.indices.entry(queue_id.to_string()).or_insert_with(QueueIndex::new);
        self.indices.get(queue_id).unwrap()
    }
}

impl Default for InMemoryStorageClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStorageClient for InMemoryStorageClient {
    async fn add_request(&self, queue_id: &str, mut request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError> {
        let index = self.index_for(queue_id);
        if let Some(existing_id) = index.unique_key_to_id.get(&request.unique_key).map(|e| e.clone()) {
            let queue = self.queues.entry(queue_id.to_string()).or_insert_with(DashMap::new);
            let entry = queue.get(&existing_id).unwrap();
            return Ok(QueueOperationInfo {
                request_id: existing_id,
                was_already_present: true,
                was_already_handled: entry.handled,
                request: entry.request.clone(),
            });
        }

        let id = request.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        request.id = Some(id.clone());
        let order_no = index.next_order_no(forefront);

        let queue = self.queues.entry(queue_id.to_string()).or_insert_with(DashMap::new);
        queue.insert(id.clone(), StoredRequest { order_no, request: request.clone(), handled: false });
        index.unique_key_to_id.insert(request.unique_key.clone(), id.clone());
        index.touch();

        Ok(QueueOperationInfo { request_id: id, was_already_present: false, was_already_handled: false, request })
    }

    async fn update_request(&self, queue_id: &str, request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CrawlError::InvalidInput("update_request requires an assigned id".to_string()))?;
        let index = self.index_for(queue_id);
        let order_no = index.next_order_no(forefront);
        let queue = self.queues.entry(queue_id.to_string()).or_insert_with(DashMap::new);
        let handled = queue.get(&id).map(|e| e.handled).unwrap_or(false);
        queue.insert(id.clone(), StoredRequest { order_no, request: request.clone(), handled });
        index.touch();
        Ok(QueueOperationInfo { request_id: id, was_already_present: true, was_already_handled: handled, request })
    }

    async fn mark_request_handled(&self, queue_id: &str, mut request: Request) -> Result<QueueOperationInfo, CrawlError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CrawlError::InvalidInput("mark_request_handled requires an assigned id".to_string()))?;
        request.mark_handled();
        let queue = self.queues.entry(queue_id.to_string()).or_insert_with(DashMap::new);
        let order_no = queue.get(&id).map(|e| e.order_no).unwrap_or(0);
        queue.insert(id.clone(), StoredRequest { order_no, request: request.clone(), handled: true });
        self.index_for(queue_id).touch();
        Ok(QueueOperationInfo { request_id: id, was_already_present: true, was_already_handled: false, request })
    }

    async fn get_request(&self, queue_id: &str, request_id: &str) -> Result<Option<Request>, CrawlError> {
        Ok(self
            .queues
            .get(queue_id)
            .and_then(|queue| queue.get(request_id).map(|e| e.request.clone())))
    }

    async fn get_head(&self, queue_id: &str, limit: usize, client_id: &str) -> Result<QueueHeadResult, CrawlError> {
        let index = self.index_for(queue_id);
        let had_multiple_clients = index.note_client(client_id);
        let queue_modified_at = index.modified_at_millis.load(Ordering::SeqCst).max(0) as u64;

        let Some(queue) = self.queues.get(queue_id) else {
            return Ok(QueueHeadResult { items: Vec::new(), queue_modified_at, had_multiple_clients });
        };
        let mut entries: Vec<(i64, Request)> = queue
            .iter()
            .filter(|e| !e.handled)
            .map(|e| (e.order_no, e.request.clone()))
            .collect();
        entries.sort_by_key(|(order_no, _)| *order_no);
        let items = entries.into_iter().take(limit).map(|(_, r)| r).collect();
        Ok(QueueHeadResult { items, queue_modified_at, had_multiple_clients })
    }

    async fn delete_queue(&self, queue_id: &str) -> Result<(), CrawlError> {
        self.queues.remove(queue_id);
        self.indices.remove(queue_id);
        Ok(())
    }

    async fn list_keys(&self, store_id: &str) -> Result<Vec<String>, CrawlError> {
        Ok(self
            .stores
            .get(store_id)
            .map(|store| store.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn get_record(&self, store_id: &str, key: &str) -> Result<Option<Vec<u8>>, CrawlError> {
        Ok(self.stores.get(store_id).and_then(|store| store.get(key).map(|v| v.clone())))
    }

    async fn set_record(&self, store_id: &str, key: &str, value: Vec<u8>) -> Result<(), CrawlError> {
        utils::validate_store_key(key).map_err(CrawlError::InvalidInput)?;
        let store = self.stores.entry(store_id.to_string()).or_insert_with(DashMap::new);
        store.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_record(&self, store_id: &str, key: &str) -> Result<(), CrawlError> {
        if let Some(store) = self.stores.get(store_id) {
            store.remove(key);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Local filesystem backend
// ---------------------------------------------------------------------

pub struct LocalFsStorageClient {
    base_dir: PathBuf,
    indices: DashMap<String, QueueIndex>,
}

impl LocalFsStorageClient {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into(), indices: DashMap::new() }
    }

    fn queue_dir(&self, queue_id: &str) -> PathBuf {
        self.base_dir.join("request_queues").join(queue_id)
    }

    fn handled_dir(&self, queue_id: &str) -> PathBuf {
        self.queue_dir(queue_id).join("handled")
    }

    fn store_dir(&self, store_id: &str) -> PathBuf {
        self.base_dir.join("key_value_stores").join(store_id)
    }

    fn index_for(&self, queue_id: &str) -> dashmap::mapref::one::Ref<'_, String, QueueIndex> {
        self.indices.entry(queue_id.to_string()).or_insert_with(QueueIndex::new);
        self.indices.get(queue_id).unwrap()
    }

    async fn ensure_dir(path: &Path) -> Result<(), CrawlError> {
        tokio::fs::create_dir_all(path).await.map_err(CrawlError::from)
    }

    fn parse_order_no(filename: &str) -> Option<i64> {
        filename.split('.').next()?.parse().ok()
    }

    /// Finds the existing file for `id` under `dir` by scanning for the
    /// `<orderNo>.<id>.json` pattern; returns its path and parsed order.
    async fn find_by_id(dir: &Path, id: &str) -> Result<Option<(PathBuf, i64)>, CrawlError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(&format!(".{id}.json")) {
                let order_no = Self::parse_order_no(&name).unwrap_or(0);
                return Ok(Some((entry.path(), order_no)));
            }
        }
        Ok(None)
    }

    async fn read_request_file(path: &Path) -> Result<Request, CrawlError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_request_file(dir: &Path, order_no: i64, id: &str, request: &Request) -> Result<(), CrawlError> {
        Self::ensure_dir(dir).await?;
        let path = dir.join(format!("{order_no}.{id}.json"));
        let bytes = serde_json::to_vec_pretty(request)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStorageClient for LocalFsStorageClient {
    async fn add_request(&self, queue_id: &str, mut request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError> {
        let index = self.index_for(queue_id);
        if let Some(existing_id) = index.unique_key_to_id.get(&request.unique_key).map(|e| e.clone()) {
            let existing = self
                .get_request(queue_id, &existing_id)
                .await?
                .ok_or_else(|| CrawlError::StateMismatch("indexed request missing on disk".to_string()))?;
            return Ok(QueueOperationInfo {
                request_id: existing_id,
                was_already_present: true,
                was_already_handled: existing.is_handled(),
                request: existing,
            });
        }

        let id = request.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        request.id = Some(id.clone());
        let order_no = index.next_order_no(forefront);
        Self::write_request_file(&self.queue_dir(queue_id), order_no, &id, &request).await?;
        index.unique_key_to_id.insert(request.unique_key.clone(), id.clone());
        index.touch();

        Ok(QueueOperationInfo { request_id: id, was_already_present: false, was_already_handled: false, request })
    }

    async fn update_request(&self, queue_id: &str, request: Request, forefront: bool) -> Result<QueueOperationInfo, CrawlError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CrawlError::InvalidInput("update_request requires an assigned id".to_string()))?;
        let index = self.index_for(queue_id);

        if let Some((old_path, _)) = Self::find_by_id(&self.queue_dir(queue_id), &id).await? {
            tokio::fs::remove_file(old_path).await?;
        }
        let order_no = index.next_order_no(forefront);
        Self::write_request_file(&self.queue_dir(queue_id), order_no, &id, &request).await?;
        index.touch();

        Ok(QueueOperationInfo { request_id: id, was_already_present: true, was_already_handled: false, request })
    }

    async fn mark_request_handled(&self, queue_id: &str, mut request: Request) -> Result<QueueOperationInfo, CrawlError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| CrawlError::InvalidInput("mark_request_handled requires an assigned id".to_string()))?;
        request.mark_handled();

        if let Some((old_path, _)) = Self::find_by_id(&self.queue_dir(queue_id), &id).await? {
            tokio::fs::remove_file(old_path).await?;
        }
        let handled_dir = self.handled_dir(queue_id);
        Self::write_request_file(&handled_dir, 0, &id, &request).await?;
        self.index_for(queue_id).touch();

        Ok(QueueOperationInfo { request_id: id, was_already_present: true, was_already_handled: false, request })
    }

    async fn get_request(&self, queue_id: &str, request_id: &str) -> Result<Option<Request>, CrawlError> {
        if let Some((path, _)) = Self::find_by_id(&self.queue_dir(queue_id), request_id).await? {
            return Ok(Some(Self::read_request_file(&path).await?));
        }
        if let Some((path, _)) = Self::find_by_id(&self.handled_dir(queue_id), request_id).await? {
            return Ok(Some(Self::read_request_file(&path).await?));
        }
        Ok(None)
    }

    async fn get_head(&self, queue_id: &str, limit: usize, client_id: &str) -> Result<QueueHeadResult, CrawlError> {
        let index = self.index_for(queue_id);
        let had_multiple_clients = index.note_client(client_id);
        let queue_modified_at = index.modified_at_millis.load(Ordering::SeqCst).max(0) as u64;

        let dir = self.queue_dir(queue_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(QueueHeadResult { items: Vec::new(), queue_modified_at, had_multiple_clients })
            }
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<(i64, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(order_no) = Self::parse_order_no(&name) {
                files.push((order_no, entry.path()));
            }
        }
        files.sort_by_key(|(order_no, _)| *order_no);

        let mut items = Vec::with_capacity(limit.min(files.len()));
        for (_, path) in files.into_iter().take(limit) {
            items.push(Self::read_request_file(&path).await?);
        }
        Ok(QueueHeadResult { items, queue_modified_at, had_multiple_clients })
    }

    async fn delete_queue(&self, queue_id: &str) -> Result<(), CrawlError> {
        let dir = self.queue_dir(queue_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.indices.remove(queue_id);
        Ok(())
    }

    async fn list_keys(&self, store_id: &str) -> Result<Vec<String>, CrawlError> {
        let dir = self.store_dir(store_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((key, _ext)) = name.rsplit_once('.') {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    async fn get_record(&self, store_id: &str, key: &str) -> Result<Option<Vec<u8>>, CrawlError> {
        utils::validate_store_key(key).map_err(CrawlError::InvalidInput)?;
        let dir = self.store_dir(store_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((found_key, _ext)) = name.rsplit_once('.') {
                if found_key == key {
                    return Ok(Some(tokio::fs::read(entry.path()).await?));
                }
            }
        }
        Ok(None)
    }

    async fn set_record(&self, store_id: &str, key: &str, value: Vec<u8>) -> Result<(), CrawlError> {
        utils::validate_store_key(key).map_err(CrawlError::InvalidInput)?;
        let dir = self.store_dir(store_id);
        Self::ensure_dir(&dir).await?;
        let ext = if serde_json::from_slice::<serde_json::Value>(&value).is_ok() { "json" } else { "bin" };
        tokio::fs::write(dir.join(format!("{key}.{ext}")), value).await?;
        Ok(())
    }

    async fn delete_record(&self, store_id: &str, key: &str) -> Result<(), CrawlError> {
        utils::validate_store_key(key).map_err(CrawlError::InvalidInput)?;
        let dir = self.store_dir(store_id);
        for ext in ["json", "bin"] {
            let path = dir.join(format!("{key}.{ext}"));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn request(url: &str) -> Request {
        Request::new(url, Method::Get, false).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_add_request_dedupes() {
        let client = InMemoryStorageClient::new();
        let info1 = client.add_request("q", request("https://example.com/a"), false).await.unwrap();
        let info2 = client.add_request("q", request("https://example.com/a"), false).await.unwrap();
        assert!(!info1.was_already_present);
        assert!(info2.was_already_present);
        assert_eq!(info1.request_id, info2.request_id);
    }

    #[tokio::test]
    async fn test_in_memory_forefront_orders_before_backfront() {
        let client = InMemoryStorageClient::new();
        client.add_request("q", request("https://example.com/back"), false).await.unwrap();
        client.add_request("q", request("https://example.com/front"), true).await.unwrap();
        let head = client.get_head("q", 10, "c1").await.unwrap();
        assert_eq!(head.items[0].url, "https://example.com/front");
    }

    #[tokio::test]
    async fn test_in_memory_mark_handled_excludes_from_head() {
        let client = InMemoryStorageClient::new();
        let info = client.add_request("q", request("https://example.com/a"), false).await.unwrap();
        client.mark_request_handled("q", info.request).await.unwrap();
        let head = client.get_head("q", 10, "c1").await.unwrap();
        assert!(head.items.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_get_head_reports_multiple_clients() {
        let client = InMemoryStorageClient::new();
        client.add_request("q", request("https://example.com/a"), false).await.unwrap();
        let first = client.get_head("q", 10, "c1").await.unwrap();
        assert!(!first.had_multiple_clients);
        let second = client.get_head("q", 10, "c2").await.unwrap();
        assert!(second.had_multiple_clients);
    }

    #[tokio::test]
    async fn test_in_memory_kv_store_roundtrip() {
        let client = InMemoryStorageClient::new();
        client.set_record("store", "key1", b"hello".to_vec()).await.unwrap();
        let value = client.get_record("store", "key1").await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));
        client.delete_record("store", "key1").await.unwrap();
        assert_eq!(client.get_record("store", "key1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_fs_add_and_get_head_round_trip() {
        let dir = std::env::temp_dir().join(format!("crawl-core-test-{}", Uuid::new_v4()));
        let client = LocalFsStorageClient::new(&dir);

        let info = client.add_request("q", request("https://example.com/a"), false).await.unwrap();
        let head = client.get_head("q", 10, "c1").await.unwrap();
        assert_eq!(head.items.len(), 1);
        assert_eq!(head.items[0].id.as_deref(), Some(info.request_id.as_str()));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_local_fs_mark_handled_moves_file() {
        let dir = std::env::temp_dir().join(format!("crawl-core-test-{}", Uuid::new_v4()));
        let client = LocalFsStorageClient::new(&dir);

        let info = client.add_request("q", request("https://example.com/a"), false).await.unwrap();
        client.mark_request_handled("q", info.request).await.unwrap();

        let head = client.get_head("q", 10, "c1").await.unwrap();
        assert!(head.items.is_empty());
        let fetched = client.get_request("q", &info.request_id).await.unwrap();
        assert!(fetched.unwrap().is_handled());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_local_fs_kv_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("crawl-core-test-{}", Uuid::new_v4()));
        let client = LocalFsStorageClient::new(&dir);

        client.set_record("store", "INPUT", br#"{"a":1}"#.to_vec()).await.unwrap();
        let keys = client.list_keys("store").await.unwrap();
        assert_eq!(keys, vec!["INPUT".to_string()]);
        let value = client.get_record("store", "INPUT").await.unwrap();
        assert_eq!(value, Some(br#"{"a":1}"#.to_vec()));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
