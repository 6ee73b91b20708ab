use std::cmp::Ordering;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use crate::cancel::CancelToken;
use crate::error::StoreError;
use crate::types::CacheMiss;
use crate::types::EventRow;
use crate::types::ItemCountReport;
use crate::types::NativeQuery;
use crate::types::PropertyMap;

/// Things that happened at a point in time and can be ordered by it.
pub trait TimeComparable {
    /// When the underlying event occurred.
    fn time_logged(&self) -> DateTime<Utc>;

    /// When the remote store last touched the record. Breaks ties between equal `time_logged`.
    fn time_stamp(&self) -> DateTime<Utc>;

    fn time_cmp(&self, other: &Self) -> Ordering {
        self.time_logged()
            .cmp(&other.time_logged())
            .then_with(|| self.time_stamp().cmp(&other.time_stamp()))
    }

    #[inline]
    fn is_logged_before(&self, instant: DateTime<Utc>) -> bool {
        self.time_logged() < instant
    }

    /// Half-open containment: `start <= time_logged < end`.
    #[inline]
    fn is_logged_within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let logged = self.time_logged();
        start <= logged && logged < end
    }
}

/// Identity and timing metadata of a cached row.
///
/// Identity is `(partition_key, row_key)`; two keys with the same identity denote the same row no matter what their
/// timestamps say.
pub trait CacheKey: TimeComparable + Clone + Debug + Send + Sync + 'static {
    fn partition_key(&self) -> &str;
    fn row_key(&self) -> &str;

    /// Start of the query window that produced this key.
    fn data_fetch_start_time(&self) -> DateTime<Utc>;
    /// End of the query window that produced this key.
    fn data_fetch_end_time(&self) -> DateTime<Utc>;
    /// When the key was placed into the cache.
    fn created_time(&self) -> DateTime<Utc>;

    /// When the row was first created upstream.
    fn original_create_time(&self) -> DateTime<Utc> {
        self.time_stamp()
    }

    fn from_row(
        row: &EventRow,
        fetch_start: DateTime<Utc>,
        fetch_end: DateTime<Utc>,
        created: DateTime<Utc>,
    ) -> Self;
}

/// Payload associated with a [`CacheKey`].
pub trait CacheValue: Clone + Debug + Send + Sync + 'static {
    fn properties(&self) -> &PropertyMap;
    fn created_time(&self) -> DateTime<Utc>;

    fn from_row(row: EventRow, created: DateTime<Utc>) -> Self;
}

/// Translates a time range into the remote store's native filter syntax.
pub trait FilterBuilder: Debug + Send + Sync + 'static {
    fn build(&self, start: DateTime<Utc>, end: DateTime<Utc>, property_filter: Option<&str>) -> String;
}

/// Client of the slow remote tabular store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Run a query against a physical table. `query.take_count` is a page size hint; implementations are expected to
    /// follow continuation until the filter is exhausted.
    async fn execute_query(
        &self,
        physical_table: &str,
        query: &NativeQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<EventRow>, StoreError>;

    async fn does_table_exist(&self, physical_table: &str, cancel: &CancelToken) -> Result<bool, StoreError>;
}

/// Fire-and-forget telemetry sink. Every error it returns is swallowed by the caller.
#[async_trait]
pub trait CacheObserver: Send + Sync + 'static {
    /// Awaited on the reader's task before a miss is fetched. Implementations should hand the record off and return
    /// quickly.
    async fn on_cache_miss(&self, _miss: &CacheMiss) -> Result<(), StoreError> {
        Ok(())
    }
    async fn on_item_counts(&self, _report: &ItemCountReport) -> Result<(), StoreError> {
        Ok(())
    }
    async fn on_warning(&self, _message: &str) -> Result<(), StoreError> {
        Ok(())
    }
    async fn on_info(&self, _message: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Observer that drops everything on the floor.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl CacheObserver for NoopObserver {}

/// Source of "now". Lets tests drive the cache through time without waiting.
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
