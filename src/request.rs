//! The `Request` entity shared by `RequestList` and `RequestQueue`: one
//! crawl target plus the metadata needed to dedupe, retry, and terminate it.

use crate::error::CrawlError;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::Get
    }
}

/// One crawl target with its metadata. `id` is assigned on first
/// persistence into a queue or list and is immutable thereafter; `uniqueKey`
/// is the deduplication identity, independent of `id`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    pub id: Option<String>,
    pub unique_key: String,
    pub url: String,
    pub method: Method,
    pub payload: Option<Vec<u8>>,
    pub headers: std::collections::HashMap<String, String>,
    pub user_data: serde_json::Value,
    pub retry_count: usize,
    pub error_messages: Vec<String>,
    pub no_retry: bool,
    pub handled_at: Option<u64>,
}

impl Request {
    /// Builds a new Request, validating the URL and deriving `uniqueKey`.
    /// `use_extended_unique_key` combines method and payload hash into the
    /// key; required when `method` is not GET and deduplication should be
    /// payload-sensitive rather than URL-only.
    pub fn new(url: &str, method: Method, use_extended_unique_key: bool) -> Result<Self, CrawlError> {
        Self::with_payload(url, method, None, use_extended_unique_key)
    }

    pub fn with_payload(
        url: &str,
        method: Method,
        payload: Option<Vec<u8>>,
        use_extended_unique_key: bool,
    ) -> Result<Self, CrawlError> {
        if method == Method::Get && payload.is_some() {
            return Err(CrawlError::InvalidInput(
                "GET requests must not carry a payload".to_string(),
            ));
        }

        let parsed: Url = utils::validate_url(url).map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;

        let unique_key = if use_extended_unique_key && method != Method::Get {
            utils::extended_unique_key(&parsed, method.as_str(), payload.as_deref())
        } else {
            utils::default_unique_key(&parsed)
        };

        Ok(Self {
            id: None,
            unique_key,
            url: url.to_string(),
            method,
            payload,
            headers: std::collections::HashMap::new(),
            user_data: serde_json::Value::Null,
            retry_count: 0,
            error_messages: Vec::new(),
            no_retry: false,
            handled_at: None,
        })
    }

    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }

    pub fn mark_handled(&mut self) {
        self.handled_at = Some(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
    }

    /// Appends an error, coercing a non-string cause via debug-formatting,
    /// the way a dynamically-typed thrown value would be.
    pub fn push_error<E: std::fmt::Debug>(&mut self, err: &E, max_errors: usize) {
        self.error_messages.push(format!("{err:?}"));
        if self.error_messages.len() > max_errors {
            self.error_messages.remove(0);
        }
    }
}

/// Result payload common to `addRequest`, `markRequestHandled`, and
/// `reclaimRequest` on a `RequestQueue`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueOperationInfo {
    pub request_id: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
    pub request: Request,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request_derives_unique_key() {
        let req = Request::new("https://example.com/a?b=1", Method::Get, false).unwrap();
        assert!(!req.unique_key.is_empty());
        assert!(req.id.is_none());
    }

    #[test]
    fn test_get_with_payload_rejected() {
        let err = Request::with_payload("https://example.com", Method::Get, Some(vec![1]), false);
        assert!(matches!(err, Err(CrawlError::InvalidInput(_))));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = Request::new("not a url", Method::Get, false);
        assert!(err.is_err());
    }

    #[test]
    fn test_extended_unique_key_used_for_post() {
        let a = Request::with_payload("https://example.com/api", Method::Post, Some(vec![1]), true).unwrap();
        let b = Request::with_payload("https://example.com/api", Method::Post, Some(vec![2]), true).unwrap();
        assert_ne!(a.unique_key, b.unique_key);
    }

    #[test]
    fn test_mark_handled() {
        let mut req = Request::new("https://example.com", Method::Get, false).unwrap();
        assert!(!req.is_handled());
        req.mark_handled();
        assert!(req.is_handled());
    }

    #[test]
    fn test_push_error_bounds_list() {
        let mut req = Request::new("https://example.com", Method::Get, false).unwrap();
        for i in 0..5 {
            req.push_error(&format!("err{i}"), 3);
        }
        assert_eq!(req.error_messages.len(), 3);
        assert_eq!(req.error_messages[0], "\"err2\"");
    }
}
