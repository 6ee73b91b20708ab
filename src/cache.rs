//! A single time-windowed cache over one remote table.
//!
//! The cache keeps every remote row logged within its completeness window `[start, end)`. The window is built once by
//! [`Cache::hydrate`], moved forward by [`Cache::update`] and shrunk at the old end by age and count based eviction.
//! Reads that fall inside the window are served from memory, everything else is passed through to the remote store.
//!
//! One `tokio` mutex per cache serializes every mutation and every range scan of the underlying
//! [`TimeOrderedStore`]. Network fetches done by `update` and by the miss path happen outside of it.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use fieldx::fxstruct;
use garde::Validate;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::config::QueryTuning;
use crate::error::CacheError;
use crate::error::Result;
use crate::fetcher::RemoteFetcher;
use crate::policy::RetentionPolicy;
use crate::store::TimeOrderedStore;
use crate::traits::CacheKey;
use crate::traits::CacheObserver;
use crate::traits::CacheValue;
use crate::traits::Clock;
use crate::types::CacheMiss;
use crate::types::CachePhase;
use crate::types::CacheQuery;
use crate::types::CacheWindow;
use crate::types::EventKey;
use crate::types::EventTable;
use crate::types::EventValue;

/// This is where the window bookkeeping happens.
///
/// ```ignore
/// let cache = Cache::builder()
///     .fetcher(fetcher)
///     .policy(RetentionPolicy::standard())
///     .clock(clock)
///     .observer(observer)
///     .build()?;
/// cache.hydrate(&token).await?;
///
/// // Every 30 seconds or so.
/// cache.update(&token).await?;
///
/// let rows = cache.execute_query(&CacheQuery::range(start, end), &token).await?;
/// ```
///
/// Building fails with [`CacheError::InvalidPolicy`] when the retention policy doesn't validate.
#[fxstruct(no_new, default(off), builder(error(CacheError), post_build))]
pub struct Cache<K = EventKey, V = EventValue>
where
    K: CacheKey,
    V: CacheValue,
{
    fetcher:  RemoteFetcher<K, V>,
    #[fieldx(default(RetentionPolicy::standard()))]
    policy:   RetentionPolicy,
    #[fieldx(default(QueryTuning::standard()))]
    tuning:   QueryTuning,
    clock:    Arc<dyn Clock>,
    observer: Arc<dyn CacheObserver>,

    #[fieldx(builder(off), default(Mutex::new(TimeOrderedStore::new())))]
    store:      Mutex<TimeOrderedStore<K, V>>,
    // Written only while `store` is locked. Readable without it.
    #[fieldx(builder(off), default(RwLock::new(CacheWindow::EMPTY)))]
    window:     RwLock<CacheWindow>,
    #[fieldx(builder(off), default(RwLock::new(CachePhase::Uninitialized)))]
    phase:      RwLock<CachePhase>,
    #[fieldx(builder(off), default(AtomicUsize::new(0)))]
    item_count: AtomicUsize,
}

impl<K, V> Cache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn post_build(self) -> Result<Self> {
        self.policy.validate()?;
        Ok(self)
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.fetcher.table().logical_name()
    }

    #[inline]
    pub fn table(&self) -> EventTable {
        self.fetcher.table()
    }

    #[inline]
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    #[inline]
    pub fn phase(&self) -> CachePhase {
        *self.phase.read()
    }

    /// Snapshot of the completeness window.
    #[inline]
    pub fn window(&self) -> CacheWindow {
        *self.window.read()
    }

    #[inline]
    pub fn item_count(&self) -> usize {
        self.item_count.load(Ordering::Acquire)
    }

    /// Pure containment check against the completeness window; stored rows are not looked at.
    pub fn is_time_range_present_in_cache(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.window().contains(start, end)
    }

    /// Build the initial window by walking backwards from now in chunks of the policy's build increment.
    ///
    /// Chunks that come back sparse make the next one wider. The walk stops at the retention horizon or once the
    /// item limit is reached. The lock is held all along. On failure the cache is left empty and uninitialized so the
    /// whole thing can be retried.
    #[instrument(level = "trace", skip(self, cancel), fields(cache = self.name()))]
    pub async fn hydrate(&self, cancel: &CancelToken) -> Result<()> {
        let mut store = self.store.lock().await;
        *self.phase.write() = CachePhase::Hydrating;

        let outcome = self.hydrate_locked(&mut store, cancel).await;

        match outcome {
            Ok(window) => {
                self.publish(&store, window);
                *self.phase.write() = CachePhase::Ready;
                info!(cache = self.name(), %window, items = store.item_count(), "hydrated");
                self.report_info(format!("{} hydrated: {} items in {}", self.name(), store.item_count(), window))
                    .await;
                Ok(())
            }
            Err(err) => {
                store.clear();
                self.publish(&store, CacheWindow::EMPTY);
                *self.phase.write() = CachePhase::Uninitialized;
                Err(err)
            }
        }
    }

    async fn hydrate_locked(&self, store: &mut TimeOrderedStore<K, V>, cancel: &CancelToken) -> Result<CacheWindow> {
        store.clear();

        let final_end = self.clock.now();
        let final_start = retention_cutoff(final_end, self.policy.max_maintain_duration());
        let increment = self.policy.build_increment();
        let max_items = self.policy.max_item_count();
        let query = CacheQuery::range(final_start, final_end);

        let mut chunk_end = final_end;
        let mut last_start = final_end;
        let mut multiplier = 1i32;

        while chunk_end > final_start && store.item_count() < max_items {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let width = increment.checked_mul(multiplier).unwrap_or(TimeDelta::MAX);
            let chunk_start = chunk_end
                .checked_sub_signed(width)
                .map_or(final_start, |start| start.max(final_start));

            let chunk = self.fetcher.fetch(&query, chunk_start, chunk_end, cancel).await?;
            let fetched = chunk.len();
            let inserted = store.store_all(chunk);
            trace!(
                cache = self.name(),
                %chunk_start,
                %chunk_end,
                fetched,
                inserted,
                multiplier,
                "hydrate chunk"
            );

            multiplier = if fetched < self.tuning.sparse_chunk_threshold() {
                multiplier.saturating_add(1)
            }
            else {
                1
            };

            last_start = chunk_start;
            chunk_end = chunk_start;
        }

        let mut window = CacheWindow::new(last_start, final_end);
        self.trim_to_limit(store, &mut window);
        Ok(window)
    }

    /// Move the window forward to now.
    ///
    /// The remote fetch happens first and without the lock; it re-reads a short look-back span behind the current end
    /// to catch rows that reached the store late. Eviction by age, insertion and trimming happen under the lock.
    #[instrument(level = "trace", skip(self, cancel), fields(cache = self.name()))]
    pub async fn update(&self, cancel: &CancelToken) -> Result<()> {
        let now = self.clock.now();
        let cutoff = retention_cutoff(now, self.policy.max_maintain_duration());
        let previous = self.window();
        let fetch_start = previous
            .end
            .checked_sub_signed(self.tuning.look_back())
            .map_or(cutoff, |start| start.max(cutoff));

        let query = CacheQuery::range(fetch_start, now);
        let fresh = self.fetcher.fetch(&query, fetch_start, now, cancel).await?;

        let mut store = self.store.lock().await;
        // A release may have cleared the cache while we were fetching; don't refill it.
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        // Re-read under the lock: a clear may have happened while fetching.
        let previous = self.window();
        let mut start = previous.start;

        let evicted = store.remove_old_keys(cutoff);
        if evicted > 0 {
            start = self.recompute_start(&store, previous.start.max(cutoff), previous.end);
        }

        if previous.is_empty() || previous.end < fetch_start {
            start = fetch_start;
        }

        let fetched = fresh.len();
        let inserted = store.store_all(fresh);

        let mut window = CacheWindow::new(start, now);
        let trimmed = self.trim_to_limit(&mut store, &mut window);
        self.publish(&store, window);

        let mut phase = self.phase.write();
        if *phase == CachePhase::Uninitialized {
            *phase = CachePhase::Ready;
        }

        debug!(
            cache = self.name(),
            %window,
            fetched,
            inserted,
            evicted,
            trimmed,
            items = store.item_count(),
            "updated"
        );

        Ok(())
    }

    /// Serve a read.
    ///
    /// Ranges narrower than the freshness delay yield nothing. Ranges the window covers up to `end - freshness_delay`
    /// are served from memory; anything else is fetched from the remote store without touching the cache. Only remote
    /// errors of that passthrough surface here.
    ///
    /// The query's native property filter only reaches the remote store, so it narrows misses but not hits. Use the
    /// client filter for anything that must hold on both paths.
    ///
    /// A miss is reported to the observer before the passthrough fetch, on the caller's task. Observers are expected to
    /// return promptly; a slow one delays every miss.
    #[instrument(level = "trace", skip(self, cancel), fields(cache = self.name()))]
    pub async fn execute_query(&self, query: &CacheQuery, cancel: &CancelToken) -> Result<Vec<V>> {
        let freshness = self.tuning.freshness_delay();
        if query.span() < freshness {
            return Ok(Vec::new());
        }

        let authoritative_end = query.end - freshness;

        if self.is_time_range_present_in_cache(query.start, authoritative_end) {
            let store = self.store.lock().await;
            // Eviction might have moved the window while we were waiting for the lock.
            if self.is_time_range_present_in_cache(query.start, authoritative_end) {
                let values = store.values_in_range(query.start, query.end);
                drop(store);

                let values = finish(values, query);
                trace!(cache = self.name(), returned = values.len(), "cache hit");
                return Ok(values);
            }
        }

        self.passthrough(query, cancel).await
    }

    async fn passthrough(&self, query: &CacheQuery, cancel: &CancelToken) -> Result<Vec<V>> {
        let miss = CacheMiss {
            cache:     self.name().to_string(),
            known:     self.window(),
            requested: CacheWindow::new(query.start, query.end),
        };
        debug!(cache = self.name(), known = %miss.known, requested = %miss.requested, "cache miss");

        if let Err(err) = self.observer.on_cache_miss(&miss).await {
            trace!(cache = self.name(), "observer failed to take a cache miss: {err}");
        }

        // The fetcher has already applied the client filter.
        let values = self
            .fetcher
            .fetch(query, query.start, query.end, cancel)
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect();

        Ok(take_tail(values, query.take_count))
    }

    /// Drop everything and reset the window. Policy and fetcher stay as they are.
    pub async fn remove_all_and_clear(&self) {
        let mut store = self.store.lock().await;
        store.clear();
        self.publish(&store, CacheWindow::EMPTY);
        *self.phase.write() = CachePhase::Ready;
        debug!(cache = self.name(), "cleared");
    }

    // Enforce the item limit by dropping the oldest keys. Keys logged at the same instant as the last dropped one go as
    // well, so the new window start never splits an instant. Returns how many keys were removed.
    fn trim_to_limit(&self, store: &mut TimeOrderedStore<K, V>, window: &mut CacheWindow) -> usize {
        let limit = self.policy.max_item_count();
        let count = store.item_count();
        if count <= limit {
            return 0;
        }

        let removed = store.remove_first_keys(count - limit);
        let Some(last_time) = removed.last_time
        else {
            return removed.count;
        };

        let boundary = last_time
            .checked_add_signed(TimeDelta::nanoseconds(1))
            .unwrap_or(last_time);
        let siblings = store.remove_old_keys(boundary);

        window.start = self.recompute_start(store, window.start.max(boundary), window.end);
        removed.count + siblings
    }

    // The earliest remaining key bounds the window from below: it is complete no further back than the end of the
    // fetch that produced the key or the key's upstream creation. The result never goes below `floor` nor above the
    // key itself.
    fn recompute_start(
        &self,
        store: &TimeOrderedStore<K, V>,
        floor: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match store.earliest_key() {
            Some(earliest) => earliest
                .data_fetch_end_time()
                .min(earliest.original_create_time())
                .min(earliest.time_logged())
                .max(floor),
            None => floor.min(end),
        }
    }

    fn publish(&self, store: &TimeOrderedStore<K, V>, window: CacheWindow) {
        *self.window.write() = window;
        self.item_count.store(store.item_count(), Ordering::Release);
    }

    async fn report_info(&self, message: String) {
        if let Err(err) = self.observer.on_info(&message).await {
            trace!(cache = self.name(), "observer failed to take a message: {err}");
        }
    }
}

impl<K, V> std::fmt::Debug for Cache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("table", &self.table())
            .field("phase", &self.phase())
            .field("window", &self.window())
            .field("item_count", &self.item_count())
            .finish()
    }
}

fn retention_cutoff(now: DateTime<Utc>, max_duration: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(max_duration)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn finish<V: CacheValue>(values: Vec<V>, query: &CacheQuery) -> Vec<V> {
    let values = match query.client_filter {
        Some(ref accept) => values.into_iter().filter(|v| accept(v.properties())).collect(),
        None => values,
    };
    take_tail(values, query.take_count)
}

// Values are ascending by time; the most recent ones are at the tail.
fn take_tail<V>(mut values: Vec<V>, take: Option<usize>) -> Vec<V> {
    if let Some(take) = take {
        if values.len() > take {
            values.drain(..values.len() - take);
        }
    }
    values
}
