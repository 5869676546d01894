//! # crawl-core
//!
//! A restartable, autoscaling web crawl frontier: a `RequestQueue`/
//! `RequestList` pair for the crawl target backlog, a `SessionPool` for
//! rotating cookie-jar identities, a `Snapshotter`/`SystemStatus` pair for
//! resource-overload detection, and an `AutoscaledPool` that drives
//! concurrency from that signal rather than a fixed worker count.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use crawl_core::{Config, Crawler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let crawler = std::sync::Arc::new(Crawler::new(config)?);
//!     crawler.enqueue_url("https://example.com").await?;
//!     crawler.start_background_tasks().await;
//!     crawler.run(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI usage
//!
//! ```bash
//! crawl-core run --input urls.txt --concurrency 20
//! crawl-core inspect --detailed
//! crawl-core validate --config crawl-core.json
//! ```

/// Configuration for every crawl subsystem, plus environment overrides.
pub mod config;

/// Error taxonomy shared across the crawl.
pub mod error;

/// URL normalization, unique-key derivation, and other small helpers.
pub mod utils;

/// The `Request` entity shared by `RequestList` and `RequestQueue`.
pub mod request;

/// Typed publish-subscribe event bus.
pub mod events;

/// A reusable cookie-jar/error-score identity.
pub mod session;

/// A bounded, persistable pool of `Session`s.
pub mod session_pool;

/// A fixed, order-preserving crawl frontier built from a set of sources.
pub mod request_list;

/// Storage backends behind `RequestQueue` and the key-value store.
pub mod storage;

/// The mutable, restartable crawl frontier.
pub mod request_queue;

/// Periodic resource sampling: memory, event loop, CPU, and client errors.
pub mod snapshotter;

/// Reduces `Snapshotter` histories into an overloaded/idle verdict.
pub mod system_status;

/// A concurrency-adaptive task scheduler gated by `SystemStatus`.
pub mod autoscaled_pool;

/// Wires the subsystems together into a runnable crawl.
pub mod crawler;

/// Performance metrics instrumentation.
pub mod metrics;

/// System health reporting built on `SystemStatus`/`SessionPool`/`RequestQueue`.
pub mod health;

/// Command-line interface implementation.
pub mod cli;

#[cfg(test)]
mod tests;

pub use autoscaled_pool::*;
pub use cli::*;
pub use config::*;
pub use crawler::*;
pub use error::*;
pub use events::*;
pub use health::*;
pub use metrics::*;
pub use request::*;
pub use request_list::*;
pub use request_queue::*;
pub use session::*;
pub use session_pool::*;
pub use snapshotter::*;
pub use storage::*;
pub use system_status::*;
pub use utils::*;
