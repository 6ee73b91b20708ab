use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
#[cfg(feature = "serde")]
use serde::Deserialize;
#[cfg(feature = "serde")]
use serde::Serialize;

use crate::filter::LoggedTimeFilterBuilder;
use crate::traits::CacheKey;
use crate::traits::CacheValue;
use crate::traits::FilterBuilder;
use crate::traits::TimeComparable;

pub type PropertyMap = HashMap<String, String>;

/// Per-row predicate evaluated in-process, after the remote store (or the cache) produced the rows.
pub type ClientFilter = Arc<dyn Fn(&PropertyMap) -> bool + Send + Sync>;

/// The instant a cleared or never-filled cache reports as both ends of its window.
pub const EPOCH_MIN: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// A raw row as the remote store returns it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventRow {
    pub partition_key: String,
    pub row_key:       String,
    pub time_logged:   DateTime<Utc>,
    pub time_stamp:    DateTime<Utc>,
    pub properties:    PropertyMap,
}

/// Default [`CacheKey`] implementation.
#[derive(Debug, Clone)]
pub struct EventKey {
    partition_key:    String,
    row_key:          String,
    time_logged:      DateTime<Utc>,
    time_stamp:       DateTime<Utc>,
    data_fetch_start: DateTime<Utc>,
    data_fetch_end:   DateTime<Utc>,
    created:          DateTime<Utc>,
}

// Identity is partition + row. Timing metadata doesn't participate.
impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.partition_key == other.partition_key && self.row_key == other.row_key
    }
}

impl Eq for EventKey {}

impl Hash for EventKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.partition_key.hash(state);
        self.row_key.hash(state);
    }
}

impl Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.partition_key, self.row_key, self.time_logged)
    }
}

impl TimeComparable for EventKey {
    #[inline]
    fn time_logged(&self) -> DateTime<Utc> {
        self.time_logged
    }

    #[inline]
    fn time_stamp(&self) -> DateTime<Utc> {
        self.time_stamp
    }
}

impl CacheKey for EventKey {
    fn partition_key(&self) -> &str {
        &self.partition_key
    }

    fn row_key(&self) -> &str {
        &self.row_key
    }

    fn data_fetch_start_time(&self) -> DateTime<Utc> {
        self.data_fetch_start
    }

    fn data_fetch_end_time(&self) -> DateTime<Utc> {
        self.data_fetch_end
    }

    fn created_time(&self) -> DateTime<Utc> {
        self.created
    }

    fn from_row(
        row: &EventRow,
        fetch_start: DateTime<Utc>,
        fetch_end: DateTime<Utc>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            partition_key:    row.partition_key.clone(),
            row_key:          row.row_key.clone(),
            time_logged:      row.time_logged,
            time_stamp:       row.time_stamp,
            data_fetch_start: fetch_start,
            data_fetch_end:   fetch_end,
            created,
        }
    }
}

/// Default [`CacheValue`] implementation. Besides the property map it keeps enough of the row to be self-describing
/// once handed back to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventValue {
    pub partition_key: String,
    pub row_key:       String,
    pub time_logged:   DateTime<Utc>,
    pub properties:    PropertyMap,
    pub created:       DateTime<Utc>,
}

impl CacheValue for EventValue {
    fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    fn created_time(&self) -> DateTime<Utc> {
        self.created
    }

    fn from_row(row: EventRow, created: DateTime<Utc>) -> Self {
        Self {
            partition_key: row.partition_key,
            row_key: row.row_key,
            time_logged: row.time_logged,
            properties: row.properties,
            created,
        }
    }
}

/// Entity-type tables of the event store. Each one gets its own cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EventTable {
    Node,
    Partition,
    Application,
    Service,
    Replica,
    Cluster,
    Correlation,
}

impl EventTable {
    pub const ALL: [EventTable; 7] = [
        EventTable::Node,
        EventTable::Partition,
        EventTable::Application,
        EventTable::Service,
        EventTable::Replica,
        EventTable::Cluster,
        EventTable::Correlation,
    ];

    /// Undecorated table name. Physical names always end with it.
    pub fn logical_name(&self) -> &'static str {
        match self {
            EventTable::Node => "Nodes",
            EventTable::Partition => "Partitions",
            EventTable::Application => "Apps",
            EventTable::Service => "Services",
            EventTable::Replica => "Replicas",
            EventTable::Cluster => "Cluster",
            EventTable::Correlation => "CorrelationTable",
        }
    }

    /// Find the table a physical (decorated) name refers to.
    pub fn from_physical_name(physical: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|table| physical.ends_with(table.logical_name()))
    }
}

impl Display for EventTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.logical_name())
    }
}

/// Lifecycle of a single cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    Uninitialized,
    Hydrating,
    Ready,
}

/// Completeness window: every remote row logged within `[start, end)` is known to be in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheWindow {
    pub start: DateTime<Utc>,
    pub end:   DateTime<Utc>,
}

impl CacheWindow {
    pub const EMPTY: CacheWindow = CacheWindow {
        start: EPOCH_MIN,
        end:   EPOCH_MIN,
    };

    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Pure containment check; says nothing about rows actually stored.
    #[inline]
    pub fn contains(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start >= self.start && end <= self.end
    }
}

impl Default for CacheWindow {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Display for CacheWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            f.write_str("[empty)")
        }
        else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

/// What a remote store client receives: the filter is already in native syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeQuery {
    pub filter:     String,
    pub start:      DateTime<Utc>,
    pub end:        DateTime<Utc>,
    pub take_count: usize,
}

/// A read request against a single cache.
#[derive(Clone)]
pub struct CacheQuery {
    pub filter_builder:  Arc<dyn FilterBuilder>,
    /// Native clause appended to the time range on remote fetches only. A read served from the cache ignores it, so
    /// it narrows misses but not hits; use `client_filter` for conditions both paths must honor.
    pub property_filter: Option<String>,
    pub client_filter:   Option<ClientFilter>,
    pub start:           DateTime<Utc>,
    pub end:             DateTime<Utc>,
    /// `None` means unbounded.
    pub take_count:      Option<usize>,
}

impl CacheQuery {
    /// A query for `[start, end)` using the logged-time filter and no extra filtering.
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            filter_builder: Arc::new(LoggedTimeFilterBuilder),
            property_filter: None,
            client_filter: None,
            start,
            end,
            take_count: None,
        }
    }

    pub fn with_filter_builder(mut self, builder: Arc<dyn FilterBuilder>) -> Self {
        self.filter_builder = builder;
        self
    }

    pub fn with_property_filter(mut self, filter: impl Into<String>) -> Self {
        self.property_filter = Some(filter.into());
        self
    }

    pub fn with_client_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&PropertyMap) -> bool + Send + Sync + 'static,
    {
        self.client_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_take_count(mut self, take: usize) -> Self {
        self.take_count = Some(take);
        self
    }

    #[inline]
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl Debug for CacheQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheQuery")
            .field("filter_builder", &self.filter_builder)
            .field("property_filter", &self.property_filter)
            .field("client_filter", &self.client_filter.is_some())
            .field("start", &self.start)
            .field("end", &self.end)
            .field("take_count", &self.take_count)
            .finish()
    }
}

/// Reported to the observer every time a read falls outside the completeness window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMiss {
    pub cache:     String,
    pub known:     CacheWindow,
    pub requested: CacheWindow,
}

/// Periodic resident-size report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemCountReport {
    pub counts:         Vec<(EventTable, usize)>,
    /// Resident memory of this process in bytes, when it could be determined.
    pub process_memory: Option<u64>,
}

impl ItemCountReport {
    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, count)| count).sum()
    }
}
