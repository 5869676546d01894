//! `RequestList`: a fixed, order-preserving crawl frontier built once from
//! explicit requests and/or remote URL lists, with restartable iteration via
//! an externally-persisted `RequestListState`.

use crate::config::RequestListConfig;
use crate::error::CrawlError;
use crate::request::{Method, Request};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

/// Matches bare `http(s)://...` tokens inside a fetched text list, stopping
/// at whitespace or a wrapping quote/bracket.
fn default_url_regex() -> Regex {
    Regex::new(r#"https?://[^\s"'<>]+"#).expect("static regex is valid")
}

pub enum RequestListSource {
    /// A request already constructed by the caller.
    Explicit(Request),
    /// A remote document to fetch and scan for URLs with `regex` (or the
    /// default URL pattern when `None`).
    RemoteUrlList { url: String, regex: Option<String> },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestListState {
    pub next_index: usize,
    pub in_progress: Vec<String>,
    pub handled_count: usize,
}

pub struct RequestList {
    config: RequestListConfig,
    requests: Vec<Request>,
    unique_key_index: HashMap<String, usize>,
    next_index: usize,
    in_progress: HashSet<String>,
    reclaimed: VecDeque<usize>,
    handled_count: usize,
}

impl RequestList {
    pub async fn new(
        config: RequestListConfig,
        sources: Vec<RequestListSource>,
        http: Option<&reqwest::Client>,
    ) -> Result<Self, CrawlError> {
        let mut requests = Vec::new();
        let mut unique_key_index = HashMap::new();

        for source in sources {
            match source {
                RequestListSource::Explicit(request) => {
                    Self::push_deduped(&mut requests, &mut unique_key_index, request, config.keep_duplicate_urls);
                }
                RequestListSource::RemoteUrlList { url, regex } => {
                    let client = http.ok_or_else(|| {
                        CrawlError::ConfigurationError(
                            "a remote URL list source requires an HTTP client".to_string(),
                        )
                    })?;
                    let text = client
                        .get(&url)
                        .send()
                        .await
                        .map_err(CrawlError::from)?
                        .text()
                        .await
                        .map_err(CrawlError::from)?;

                    let pattern = match &regex {
                        Some(p) => Regex::new(p).map_err(|e| CrawlError::ConfigurationError(e.to_string()))?,
                        None => default_url_regex(),
                    };

                    for found in pattern.find_iter(&text) {
                        match Request::new(found.as_str(), Method::Get, false) {
                            Ok(request) => Self::push_deduped(
                                &mut requests,
                                &mut unique_key_index,
                                request,
                                config.keep_duplicate_urls,
                            ),
                            Err(err) => warn!("skipping unparsable URL from remote list: {err}"),
                        }
                    }
                }
            }
        }

        Ok(Self {
            config,
            requests,
            unique_key_index,
            next_index: 0,
            in_progress: HashSet::new(),
            reclaimed: VecDeque::new(),
            handled_count: 0,
        })
    }

    fn push_deduped(
        requests: &mut Vec<Request>,
        unique_key_index: &mut HashMap<String, usize>,
        request: Request,
        keep_duplicates: bool,
    ) {
        if !keep_duplicates && unique_key_index.contains_key(&request.unique_key) {
            return;
        }
        unique_key_index.insert(request.unique_key.clone(), requests.len());
        requests.push(request);
    }

    /// Restores `nextIndex`/`inProgress`/`handledCount` from a previous run.
    /// Entries in `state.in_progress` whose `uniqueKey` no longer exists in
    /// the current sources are dropped with a warning rather than failing —
    /// the sources may have changed between runs.
    pub fn restore_state(&mut self, state: RequestListState) {
        self.next_index = state.next_index;
        self.handled_count = state.handled_count;
        self.in_progress = state
            .in_progress
            .into_iter()
            .filter(|key| {
                let exists = self.unique_key_index.contains_key(key);
                if !exists {
                    warn!("dropping in-progress entry '{key}' absent from current sources");
                }
                exists
            })
            .collect();
    }

    pub fn get_state(&self) -> RequestListState {
        RequestListState {
            next_index: self.next_index,
            in_progress: self.in_progress.iter().cloned().collect(),
            handled_count: self.handled_count,
        }
    }

    /// Returns the next request to process: a previously reclaimed one first
    /// (retried before fresh ones), otherwise the next unseen one in order.
    pub fn fetch_next_request(&mut self) -> Option<Request> {
        if let Some(index) = self.reclaimed.pop_front() {
            let request = self.requests[index].clone();
            self.in_progress.insert(request.unique_key.clone());
            return Some(request);
        }

        while self.next_index < self.requests.len() {
            let index = self.next_index;
            self.next_index += 1;
            let request = &self.requests[index];
            if request.is_handled() {
                continue;
            }
            self.in_progress.insert(request.unique_key.clone());
            return Some(request.clone());
        }

        None
    }

    pub fn mark_request_handled(&mut self, unique_key: &str) -> Result<(), CrawlError> {
        let index = *self
            .unique_key_index
            .get(unique_key)
            .ok_or_else(|| CrawlError::InvalidInput(format!("unknown uniqueKey '{unique_key}'")))?;
        if !self.in_progress.remove(unique_key) {
            return Err(CrawlError::StateMismatch(format!(
                "'{unique_key}' is not in progress"
            )));
        }
        self.requests[index].mark_handled();
        self.handled_count += 1;
        Ok(())
    }

    /// Returns an in-progress request to the queue so it will be fetched
    /// again, ahead of any not-yet-seen requests.
    pub fn reclaim_request(&mut self, unique_key: &str) -> Result<(), CrawlError> {
        let index = *self
            .unique_key_index
            .get(unique_key)
            .ok_or_else(|| CrawlError::InvalidInput(format!("unknown uniqueKey '{unique_key}'")))?;
        if !self.in_progress.remove(unique_key) {
            return Err(CrawlError::StateMismatch(format!(
                "'{unique_key}' is not in progress"
            )));
        }
        self.reclaimed.push_back(index);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.next_index >= self.requests.len()
    }

    pub fn is_finished(&self) -> bool {
        self.is_empty() && self.in_progress.is_empty()
    }

    pub fn length(&self) -> usize {
        self.requests.len()
    }

    pub fn handled_count(&self) -> usize {
        self.handled_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(keep_duplicates: bool) -> RequestListConfig {
        RequestListConfig {
            keep_duplicate_urls: keep_duplicates,
            persist_requests_key: None,
            persist_state_key: None,
        }
    }

    fn explicit(url: &str) -> RequestListSource {
        RequestListSource::Explicit(Request::new(url, Method::Get, false).unwrap())
    }

    #[tokio::test]
    async fn test_dedupes_by_unique_key() {
        let sources = vec![explicit("https://example.com/a"), explicit("https://example.com/a")];
        let list = RequestList::new(config(false), sources, None).await.unwrap();
        assert_eq!(list.length(), 1);
    }

    #[tokio::test]
    async fn test_keep_duplicate_urls_retains_both() {
        let sources = vec![explicit("https://example.com/a"), explicit("https://example.com/a")];
        let list = RequestList::new(config(true), sources, None).await.unwrap();
        assert_eq!(list.length(), 2);
    }

    #[tokio::test]
    async fn test_fetch_mark_handled_finishes_list() {
        let sources = vec![explicit("https://example.com/a"), explicit("https://example.com/b")];
        let mut list = RequestList::new(config(false), sources, None).await.unwrap();

        let r1 = list.fetch_next_request().unwrap();
        let r2 = list.fetch_next_request().unwrap();
        assert!(list.fetch_next_request().is_none());
        assert!(!list.is_finished());

        list.mark_request_handled(&r1.unique_key).unwrap();
        list.mark_request_handled(&r2.unique_key).unwrap();
        assert!(list.is_finished());
        assert_eq!(list.handled_count(), 2);
    }

    #[tokio::test]
    async fn test_reclaim_returns_request_before_fresh_ones() {
        let sources = vec![explicit("https://example.com/a"), explicit("https://example.com/b")];
        let mut list = RequestList::new(config(false), sources, None).await.unwrap();

        let r1 = list.fetch_next_request().unwrap();
        list.reclaim_request(&r1.unique_key).unwrap();

        let next = list.fetch_next_request().unwrap();
        assert_eq!(next.unique_key, r1.unique_key);
    }

    #[tokio::test]
    async fn test_state_round_trip_drops_unknown_in_progress() {
        let sources = vec![explicit("https://example.com/a")];
        let mut list = RequestList::new(config(false), sources, None).await.unwrap();
        let _ = list.fetch_next_request();
        let state = list.get_state();

        let sources2 = vec![explicit("https://example.com/a")];
        let mut restored = RequestList::new(config(false), sources2, None).await.unwrap();
        restored.restore_state(state);
        assert_eq!(restored.next_index, 1);

        let mut bad_state = RequestListState {
            next_index: 0,
            in_progress: vec!["not-a-real-key".to_string()],
            handled_count: 0,
        };
        bad_state.in_progress.push("not-a-real-key".to_string());
        let sources3 = vec![explicit("https://example.com/a")];
        let mut restored2 = RequestList::new(config(false), sources3, None).await.unwrap();
        restored2.restore_state(bad_state);
        assert!(restored2.in_progress.is_empty());
    }
}
