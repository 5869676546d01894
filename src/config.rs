//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration records for every crawl subsystem:
//! the request queue, request list, session pool, snapshotter, system
//! status, and autoscaled pool, plus the top-level `Config` that aggregates
//! them and the environment variables that override it at startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration aggregating every subsystem's config record.
///
/// # Examples
///
/// ```rust
/// use crawl_core::Config;
///
/// let config = Config::default();
/// let config = Config { local_storage_dir: Some("./storage".into()), ..Default::default() };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Root directory for the local backend; `None` means in-memory (default).
    pub local_storage_dir: Option<String>,

    /// Credential for the remote storage backend, if any.
    pub token: Option<String>,

    /// Total-memory override for the snapshotter, in megabytes.
    pub memory_mbytes: Option<usize>,

    /// Default id for the default request queue.
    pub default_request_queue_id: String,

    /// Default id for the default key-value store.
    pub default_key_value_store_id: String,

    /// Key under which initial input is stored in the default store.
    pub input_key: String,

    /// Whether a headless browser adapter would be used by the caller; the
    /// core does not launch browsers itself but carries the flag through.
    pub headless: bool,

    /// Feature toggle: autoscaling is only enabled when this is true,
    /// mirroring the "at-home" deployment distinction upstream systems use.
    pub is_at_home: bool,

    pub proxy: Option<ProxyConfig>,

    pub request_queue: RequestQueueConfig,
    pub request_list: RequestListConfig,
    pub session_pool: SessionPoolConfig,
    pub snapshotter: SnapshotterConfig,
    pub system_status: SystemStatusConfig,
    pub autoscaled_pool: AutoscaledPoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_storage_dir: None,
            token: None,
            memory_mbytes: None,
            default_request_queue_id: "default".to_string(),
            default_key_value_store_id: "default".to_string(),
            input_key: "INPUT".to_string(),
            headless: true,
            is_at_home: false,
            proxy: None,
            request_queue: RequestQueueConfig::default(),
            request_list: RequestListConfig::default(),
            session_pool: SessionPoolConfig::default(),
            snapshotter: SnapshotterConfig::default(),
            system_status: SystemStatusConfig::default(),
            autoscaled_pool: AutoscaledPoolConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the environment variables named in the
    /// external-interfaces contract, overlaying them on `Config::default()`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("LOCAL_STORAGE_DIR") {
            config.local_storage_dir = Some(dir);
        }
        if let Ok(token) = std::env::var("TOKEN") {
            config.token = Some(token);
        }
        if let Ok(id) = std::env::var("DEFAULT_REQUEST_QUEUE_ID") {
            config.default_request_queue_id = id;
        }
        if let Ok(id) = std::env::var("DEFAULT_KEY_VALUE_STORE_ID") {
            config.default_key_value_store_id = id;
        }
        if let Ok(key) = std::env::var("INPUT_KEY") {
            config.input_key = key;
        }
        if let Ok(mbytes) = std::env::var("MEMORY_MBYTES") {
            if let Ok(parsed) = mbytes.parse() {
                config.memory_mbytes = Some(parsed);
            }
        }
        if let Ok(headless) = std::env::var("HEADLESS") {
            config.headless = headless != "0" && !headless.eq_ignore_ascii_case("false");
        }
        if let Ok(at_home) = std::env::var("IS_AT_HOME") {
            config.is_at_home = at_home == "1" || at_home.eq_ignore_ascii_case("true");
        }

        let proxy_hostname = std::env::var("PROXY_HOSTNAME").ok();
        let proxy_port = std::env::var("PROXY_PORT").ok().and_then(|p| p.parse().ok());
        if let (Some(hostname), Some(port)) = (proxy_hostname, proxy_port) {
            config.proxy = Some(ProxyConfig {
                hostname,
                port,
                password: std::env::var("PROXY_PASSWORD").ok(),
            });
        }

        config
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub hostname: String,
    pub port: u16,
    pub password: Option<String>,
}

/// Configuration for `RequestQueue`'s caching, consistency, and retry knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestQueueConfig {
    /// Capacity of the optimistic `queueHeadDict` cache.
    pub query_head_min_length: usize,

    /// Extra items to fetch on a head refresh when a longer head is needed.
    pub query_head_buffer_length: usize,

    /// Capacity of the `recentlyHandled` and `requestsCache` LRUs.
    pub cache_capacity: usize,

    /// Delay before trusting a just-written id to be visible on re-fetch.
    pub storage_consistency_delay: Duration,

    /// Minimum age of a `queueModifiedAt` head response before `isFinished`
    /// trusts it as authoritative.
    pub api_processed_requests_delay: Duration,

    pub max_retry_attempts: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_multiplier: f64,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            query_head_min_length: 100,
            query_head_buffer_length: 0,
            cache_capacity: 1000,
            storage_consistency_delay: Duration::from_millis(50),
            api_processed_requests_delay: Duration::from_secs(10),
            max_retry_attempts: 5,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(10),
            retry_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestListConfig {
    pub keep_duplicate_urls: bool,
    pub persist_requests_key: Option<String>,
    pub persist_state_key: Option<String>,
}

impl Default for RequestListConfig {
    fn default() -> Self {
        Self {
            keep_duplicate_urls: false,
            persist_requests_key: None,
            persist_state_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionPoolConfig {
    pub max_pool_size: usize,
    pub persist_state_key: Option<String>,
    pub session_max_age: Duration,
    pub session_max_error_score: f64,
    pub session_error_score_decrement: f64,
    pub session_max_usage_count: usize,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            persist_state_key: None,
            session_max_age: Duration::from_secs(30 * 60),
            session_max_error_score: 3.0,
            session_error_score_decrement: 0.5,
            session_max_usage_count: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotterConfig {
    pub memory_snapshot_interval: Duration,
    pub event_loop_snapshot_interval: Duration,
    pub client_snapshot_interval: Duration,
    pub snapshot_history: Duration,
    pub max_used_memory_ratio: f64,
    pub ignore_main_process: bool,
    pub critical_overload_ratio: f64,
    pub max_blocked_millis: u64,
    pub max_client_errors: u64,
    /// Total-memory override, in megabytes; `None` means the snapshotter
    /// falls back to querying the system for total memory.
    pub memory_mbytes: Option<usize>,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            memory_snapshot_interval: Duration::from_secs(1),
            event_loop_snapshot_interval: Duration::from_millis(500),
            client_snapshot_interval: Duration::from_secs(1),
            snapshot_history: Duration::from_secs(60),
            max_used_memory_ratio: 0.7,
            ignore_main_process: false,
            critical_overload_ratio: 0.9,
            max_blocked_millis: 50,
            max_client_errors: 3,
            memory_mbytes: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemStatusConfig {
    pub current_history: Duration,
    pub max_memory_overloaded_ratio: f64,
    pub max_event_loop_overloaded_ratio: f64,
    pub max_cpu_overloaded_ratio: f64,
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            current_history: Duration::from_secs(5),
            max_memory_overloaded_ratio: 0.2,
            max_event_loop_overloaded_ratio: 0.6,
            max_cpu_overloaded_ratio: 0.4,
            max_client_overloaded_ratio: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoscaledPoolConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency: usize,
    pub maybe_run_interval: Duration,
    pub scale_up_interval: Duration,
    pub scale_down_interval: Duration,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
}

impl Default for AutoscaledPoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: 10,
            maybe_run_interval: Duration::from_millis(500),
            scale_up_interval: Duration::from_secs(10),
            scale_down_interval: Duration::from_secs(5),
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
        }
    }
}
