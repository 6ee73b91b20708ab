//! # events-cache
//!
//! Time-windowed read cache for append-only event tables living in a remote store.
//!
//! Think of it as a local copy of the recent past: the tail of every event table, kept fresh by a background loop,
//! answers reads without a round trip as long as the requested time range is covered by what has been loaded.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - A remote, query-only store holding one table per entity type (nodes, partitions, applications, services,
//!   replicas, the cluster itself, and correlations between events).
//! - Rows are only ever appended, and each is tagged with the time it was logged.
//! - Most reads target the last few hours and arrive far more often than new rows do.
//!
//! The cache operates on the following principles:
//!
//! - One [`Cache`] per table, all of them owned by a [`CacheRegistry`].
//! - Each cache maintains a contiguous window `[start, end)` of logged time and holds every row of the table that was
//!   logged within it. A read fully inside the window is served locally; any other read goes to the remote store and
//!   leaves the cache untouched.
//! - The window is bounded by a [`RetentionPolicy`](policy::RetentionPolicy): rows older than the retention period or
//!   beyond the item limit are evicted from the old end.
//! - A background loop hydrates every cache once and then periodically pulls what was logged since the last update,
//!   looking a few minutes back to pick up rows that reached the store late.
//! - Keys and values are generic, see [`CacheKey`](traits::CacheKey) and [`CacheValue`](traits::CacheValue); the
//!   remote store and the telemetry sink are traits as well.
//! - Fully async. Every remote call can be cancelled.
//!
//! # Reads
//!
//! A read is answered from the cache when `[start, end - freshness_delay)` is contained in the cache window, where
//! the freshness delay (a minute by default) accounts for rows that have been logged but have not yet reached the
//! store. Reads spanning less than the freshness delay return nothing. A miss is reported to the
//! [`CacheObserver`](traits::CacheObserver) and served from the remote store.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use events_cache::prelude::*;
//! # async fn demo(remote: Arc<dyn RemoteStore>) -> events_cache::error::Result<()> {
//! let registry = Arc::new(
//!     CacheRegistry::<EventKey, EventValue>::builder()
//!         .config(RegistryConfig::standard())
//!         .remote(remote)
//!         .clock(Arc::new(SystemClock))
//!         .observer(Arc::new(NoopObserver))
//!         .build()?,
//! );
//! let updater = registry.kick_off_updater();
//!
//! let now = chrono::Utc::now();
//! let query = CacheQuery::range(now - chrono::TimeDelta::hours(1), now).with_take_count(50);
//! let events = registry
//!     .execute_query("fab01Nodes", &query, registry.cancel_token())
//!     .await?;
//! # let _ = events;
//!
//! registry.release_access().await;
//! updater.await??;
//! # Ok(())
//! # }
//! ```
//!
//! # Simulation
//!
//! The `simulation` feature enables the [`test`] module's replay app: an in-memory store fed with a synthetic event
//! stream, simulated time, injected remote failures, and a check of every read against the store. Run it with
//! `cargo run --example replay --features simulation`.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod store;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::Cache;
#[doc(inline)]
pub use registry::CacheRegistry;

pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::cancel::CancelToken;
    pub use crate::config::QueryTuning;
    pub use crate::config::RefreshSettings;
    pub use crate::config::RegistryConfig;
    pub use crate::config::TableNaming;
    pub use crate::error::CacheError;
    pub use crate::policy::RetentionPolicy;
    pub use crate::registry::CacheRegistry;
    pub use crate::traits::*;
    pub use crate::types::*;
}
