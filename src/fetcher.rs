//! Remote fetch path shared by every read and refresh of a cache.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::OnceCell;
use tracing::debug;
use tracing::instrument;

use crate::cancel::CancelToken;
use crate::config::TableNaming;
use crate::config::MAX_TAKE_COUNT;
use crate::error::CacheError;
use crate::error::Result;
use crate::traits::CacheKey;
use crate::traits::CacheValue;
use crate::traits::Clock;
use crate::traits::RemoteStore;
use crate::types::CacheQuery;
use crate::types::EventTable;
use crate::types::NativeQuery;

/// Issues queries against one remote table and turns rows into cache entries.
///
/// The physical table name is resolved on first use and then reused. Resolution fails with
/// [`CacheError::TableMissing`] if the store doesn't know the table; a later call will try again.
pub struct RemoteFetcher<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    store:    Arc<dyn RemoteStore>,
    table:    EventTable,
    naming:   TableNaming,
    clock:    Arc<dyn Clock>,
    physical: OnceCell<String>,
    _entry:   PhantomData<fn() -> (K, V)>,
}

impl<K, V> RemoteFetcher<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(store: Arc<dyn RemoteStore>, table: EventTable, naming: TableNaming, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            table,
            naming,
            clock,
            physical: OnceCell::new(),
            _entry: PhantomData,
        }
    }

    #[inline]
    pub fn table(&self) -> EventTable {
        self.table
    }

    /// Physical name if it has been resolved already.
    pub fn resolved_name(&self) -> Option<&str> {
        self.physical.get().map(String::as_str)
    }

    async fn physical_name(&self, cancel: &CancelToken) -> Result<&str> {
        let name = self
            .physical
            .get_or_try_init(|| async {
                let candidate = self.naming.decorate(self.table.logical_name());
                let exists = tokio::select! {
                    exists = self.store.does_table_exist(&candidate, cancel) => exists.map_err(|source| {
                        CacheError::Remote {
                            table: candidate.clone(),
                            source,
                        }
                    })?,
                    _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                };

                if exists {
                    debug!(table = %self.table, physical = candidate, "resolved remote table");
                    Ok(candidate)
                }
                else {
                    Err(CacheError::TableMissing(candidate))
                }
            })
            .await?;
        Ok(name.as_str())
    }

    /// Fetch `[start, end)` from the remote store using the query's filter builder, property filter and take count.
    /// The query's own `start`/`end` are ignored in favor of the explicit bounds.
    ///
    /// Returned entries carry the fetch window and the current time as their creation time. The client filter, if
    /// any, has already been applied.
    #[instrument(level = "trace", skip(self, query, cancel), fields(table = %self.table))]
    pub async fn fetch(
        &self,
        query: &CacheQuery,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<Vec<(K, V)>> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let physical = self.physical_name(cancel).await?;

        let native = NativeQuery {
            filter: query
                .filter_builder
                .build(start, end, query.property_filter.as_deref()),
            start,
            end,
            take_count: query.take_count.map_or(MAX_TAKE_COUNT, |take| take.min(MAX_TAKE_COUNT)),
        };

        let rows = tokio::select! {
            rows = self.store.execute_query(physical, &native, cancel) => rows.map_err(|source| CacheError::Remote {
                table: physical.to_string(),
                source,
            })?,
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
        };

        let fetched = rows.len();
        let created = self.clock.now();
        let entries: Vec<(K, V)> = rows
            .into_iter()
            .filter(|row| {
                query
                    .client_filter
                    .as_ref()
                    .map_or(true, |accept| accept(&row.properties))
            })
            .map(|row| {
                let key = K::from_row(&row, start, end, created);
                (key, V::from_row(row, created))
            })
            .collect();

        debug!(
            table = %self.table,
            %start,
            %end,
            fetched,
            kept = entries.len(),
            "remote fetch complete"
        );

        Ok(entries)
    }
}

impl<K, V> Debug for RemoteFetcher<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFetcher")
            .field("table", &self.table)
            .field("physical", &self.physical.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::SecondsFormat;
    use chrono::TimeDelta;

    use super::*;
    use crate::filter::TimestampFilterBuilder;
    use crate::test::event_row;
    use crate::test::ManualClock;
    use crate::test::MemoryStore;
    use crate::traits::TimeComparable;
    use crate::types::EventKey;
    use crate::types::EventValue;

    type Fetcher = RemoteFetcher<EventKey, EventValue>;

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, Fetcher) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let naming = TableNaming::new("fab", "01");
        store.create_table(&naming.decorate(EventTable::Node.logical_name()));
        let fetcher = Fetcher::new(store.clone(), EventTable::Node, naming, clock.clone());
        (store, clock, fetcher)
    }

    #[tokio::test]
    async fn resolves_physical_name_once() {
        let (store, clock, fetcher) = setup();
        let now = clock.now();
        let query = CacheQuery::range(now - TimeDelta::hours(1), now);

        assert!(fetcher.resolved_name().is_none());
        fetcher
            .fetch(&query, query.start, query.end, &CancelToken::new())
            .await
            .unwrap();
        fetcher
            .fetch(&query, query.start, query.end, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(fetcher.resolved_name(), Some("fab01Nodes"));
        assert_eq!(store.existence_checks(), 1);
        assert_eq!(store.query_count("fab01Nodes"), 2);
    }

    #[tokio::test]
    async fn tags_entries_and_applies_client_filter() {
        let (store, clock, fetcher) = setup();
        let now = clock.now();
        let start = now - TimeDelta::hours(1);

        let mut keep = event_row("p", "keep", now - TimeDelta::minutes(10));
        keep.properties.insert("Kind".into(), "NodeDown".into());
        let drop = event_row("p", "drop", now - TimeDelta::minutes(5));
        store.insert_rows("fab01Nodes", [keep, drop]);

        let query = CacheQuery::range(start, now).with_client_filter(|props| props.contains_key("Kind"));
        let entries = fetcher.fetch(&query, start, now, &CancelToken::new()).await.unwrap();

        assert_eq!(entries.len(), 1);
        let (key, value) = &entries[0];
        assert_eq!(key.row_key(), "keep");
        assert_eq!(key.data_fetch_start_time(), start);
        assert_eq!(key.data_fetch_end_time(), now);
        assert_eq!(key.created_time(), now);
        assert_eq!(key.time_logged(), now - TimeDelta::minutes(10));
        assert_eq!(value.properties.get("Kind").map(String::as_str), Some("NodeDown"));
    }

    #[tokio::test]
    async fn take_count_is_capped() {
        let (store, clock, fetcher) = setup();
        let now = clock.now();
        let token = CancelToken::new();

        let unbounded = CacheQuery::range(now - TimeDelta::hours(1), now);
        fetcher.fetch(&unbounded, unbounded.start, unbounded.end, &token).await.unwrap();

        let huge = unbounded.clone().with_take_count(50_000);
        fetcher.fetch(&huge, huge.start, huge.end, &token).await.unwrap();

        let small = unbounded.clone().with_take_count(10);
        fetcher.fetch(&small, small.start, small.end, &token).await.unwrap();

        let takes: Vec<usize> = store
            .recorded_queries("fab01Nodes")
            .iter()
            .map(|q| q.take_count)
            .collect();
        assert_eq!(takes, vec![MAX_TAKE_COUNT, MAX_TAKE_COUNT, 10]);
    }

    #[tokio::test]
    async fn native_filter_follows_the_query() {
        let (store, clock, fetcher) = setup();
        let now = clock.now();
        let token = CancelToken::new();
        // The explicit bounds win over the query's own range.
        let start = now - TimeDelta::minutes(30);
        let end = now - TimeDelta::minutes(10);
        let stamp = |instant: DateTime<Utc>| instant.to_rfc3339_opts(SecondsFormat::Millis, true);

        let plain = CacheQuery::range(now - TimeDelta::hours(1), now);
        fetcher.fetch(&plain, start, end, &token).await.unwrap();

        let narrowed = plain.clone().with_property_filter("EventType eq 'NodeDown'");
        fetcher.fetch(&narrowed, start, end, &token).await.unwrap();

        let by_timestamp = narrowed.clone().with_filter_builder(Arc::new(TimestampFilterBuilder));
        fetcher.fetch(&by_timestamp, start, end, &token).await.unwrap();

        let recorded = store.recorded_queries("fab01Nodes");
        assert_eq!(recorded.len(), 3);
        assert_eq!(
            recorded[0].filter,
            format!(
                "TimeLogged ge datetime'{}' and TimeLogged lt datetime'{}'",
                stamp(start),
                stamp(end)
            )
        );
        assert_eq!(
            recorded[1].filter,
            format!(
                "TimeLogged ge datetime'{}' and TimeLogged lt datetime'{}' and (EventType eq 'NodeDown')",
                stamp(start),
                stamp(end)
            )
        );
        assert_eq!(
            recorded[2].filter,
            format!(
                "Timestamp ge datetime'{}' and Timestamp lt datetime'{}' and (EventType eq 'NodeDown')",
                stamp(start),
                stamp(end)
            )
        );
        assert!(recorded.iter().all(|q| q.start == start && q.end == end));
    }

    #[tokio::test]
    async fn missing_table_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Fetcher::new(
            store.clone(),
            EventTable::Cluster,
            TableNaming::default(),
            Arc::new(ManualClock::default()),
        );
        let now = Utc::now();
        let query = CacheQuery::range(now - TimeDelta::hours(1), now);

        let err = fetcher
            .fetch(&query, query.start, query.end, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::TableMissing(ref name) if name == "Cluster"));
        assert!(fetcher.resolved_name().is_none());
    }

    #[tokio::test]
    async fn remote_failure_names_the_table() {
        let (store, clock, fetcher) = setup();
        let now = clock.now();
        store.fail_next_queries(1);

        let query = CacheQuery::range(now - TimeDelta::hours(1), now);
        let err = fetcher
            .fetch(&query, query.start, query.end, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Remote { ref table, .. } if table == "fab01Nodes"));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (store, clock, fetcher) = setup();
        let now = clock.now();
        let token = CancelToken::new();
        token.cancel();

        let query = CacheQuery::range(now - TimeDelta::hours(1), now);
        let err = fetcher.fetch(&query, query.start, query.end, &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(store.query_count("fab01Nodes"), 0);
    }
}
