//! One cache per event table plus the background loop keeping them fresh.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use fieldx::fxstruct;
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::trace;

use crate::cache::Cache;
use crate::cancel::CancelToken;
use crate::config::RegistryConfig;
use crate::error::CacheError;
use crate::error::Result;
use crate::fetcher::RemoteFetcher;
use crate::retry::with_retries;
use crate::traits::CacheKey;
use crate::traits::CacheObserver;
use crate::traits::CacheValue;
use crate::traits::Clock;
use crate::traits::RemoteStore;
use crate::types::CacheQuery;
use crate::types::EventKey;
use crate::types::EventTable;
use crate::types::EventValue;
use crate::types::ItemCountReport;

/// Entry point for reads and owner of the refresh loop.
///
/// Built once per process and shared behind an [`Arc`]. The registry owns the cancellation token of its loop;
/// [`release_access`](Self::release_access) fires it.
///
/// ```ignore
/// let registry = CacheRegistry::<EventKey, EventValue>::builder()
///     .config(config)
///     .remote(remote)
///     .clock(Arc::new(SystemClock))
///     .observer(Arc::new(NoopObserver))
///     .build()?;
/// ```
///
/// Building fails with [`CacheError::InvalidPolicy`] when any table's retention policy doesn't validate.
#[fxstruct(no_new, default(off), builder(error(CacheError), post_build))]
pub struct CacheRegistry<K = EventKey, V = EventValue>
where
    K: CacheKey,
    V: CacheValue,
{
    #[fieldx(default(RegistryConfig::standard()))]
    config:   RegistryConfig,
    remote:   Arc<dyn RemoteStore>,
    clock:    Arc<dyn Clock>,
    observer: Arc<dyn CacheObserver>,

    #[fieldx(builder(off), default(BTreeMap::new()))]
    caches: BTreeMap<EventTable, Arc<Cache<K, V>>>,
    #[fieldx(builder(off), default(CancelToken::new()))]
    cancel: CancelToken,
    // The builder carries no field mentioning the key and value types.
    #[fieldx(default(PhantomData))]
    _kv:    PhantomData<(K, V)>,
}

impl<K, V> CacheRegistry<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn post_build(mut self) -> Result<Self> {
        for table in EventTable::ALL {
            let fetcher = RemoteFetcher::new(
                self.remote.clone(),
                table,
                self.config.naming().clone(),
                self.clock.clone(),
            );
            let cache = Cache::builder()
                .fetcher(fetcher)
                .policy(self.config.policy_for(table))
                .tuning(self.config.tuning().clone())
                .clock(self.clock.clone())
                .observer(self.observer.clone())
                .build()?;
            self.caches.insert(table, Arc::new(cache));
        }
        Ok(self)
    }

    /// The cache serving `table`.
    pub fn cache(&self, table: EventTable) -> &Arc<Cache<K, V>> {
        // Every table gets a cache at construction.
        &self.caches[&table]
    }

    pub fn caches(&self) -> impl Iterator<Item = &Arc<Cache<K, V>>> {
        self.caches.values()
    }

    /// The token [`release_access`](Self::release_access) cancels.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn item_counts(&self) -> Vec<(EventTable, usize)> {
        self.caches
            .iter()
            .map(|(table, cache)| (*table, cache.item_count()))
            .collect()
    }

    /// Serve a read against the table whose logical name `physical_table` ends with.
    ///
    /// # Panics
    ///
    /// When no table matches. That's a mismatch between the caller and the registry, not a runtime condition.
    pub async fn execute_query(
        &self,
        physical_table: &str,
        query: &CacheQuery,
        cancel: &CancelToken,
    ) -> Result<Vec<V>> {
        let table = EventTable::from_physical_name(physical_table)
            .unwrap_or_else(|| panic!("no cache serves table '{physical_table}'"));
        self.cache(table).execute_query(query, cancel).await
    }

    /// Start the refresh loop: hydrate every cache, then update them all on the configured cadence until cancelled.
    ///
    /// The task ends with `Ok(())` when cancelled and with the first failure that outlived its retries otherwise.
    pub fn kick_off_updater(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.run_updater().await })
    }

    /// Cancel the refresh loop and empty every cache. Safe to call more than once and while the loop is running.
    pub async fn release_access(&self) {
        self.cancel.cancel();
        for cache in self.caches.values() {
            cache.remove_all_and_clear().await;
        }
        debug!("caches released");
    }

    async fn run_updater(&self) -> Result<()> {
        match self.refresh_loop().await {
            Err(err) if err.is_cancelled() => {
                info!("cache updater cancelled");
                Ok(())
            }
            Err(err) => {
                error!("cache updater stopped: {err}");
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn refresh_loop(&self) -> Result<()> {
        let cancel = &self.cancel;
        let refresh = self.config.refresh();

        let mut first_failure = None;
        for cache in self.caches.values() {
            let outcome = with_retries(
                &format!("hydrate {}", cache.name()),
                refresh.max_retries(),
                refresh.retry_delay(),
                cancel,
                || cache.hydrate(cancel),
            )
            .await;
            self.note_failure(cache, outcome, &mut first_failure).await?;
        }
        if let Some(err) = first_failure.take() {
            return Err(err);
        }
        info!(items = self.item_counts().iter().map(|(_, c)| c).sum::<usize>(), "caches hydrated");

        let mut last_telemetry: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let started = Instant::now();
            for cache in self.caches.values() {
                let outcome = with_retries(
                    &format!("update {}", cache.name()),
                    refresh.max_retries(),
                    refresh.retry_delay(),
                    cancel,
                    || cache.update(cancel),
                )
                .await;
                self.note_failure(cache, outcome, &mut first_failure).await?;
            }
            if let Some(err) = first_failure.take() {
                return Err(err);
            }

            let remaining = refresh.update_interval().saturating_sub(started.elapsed());
            trace!(elapsed = ?started.elapsed(), sleep = ?remaining, "refresh tick done");
            if !remaining.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => (),
                    _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                }
            }

            if last_telemetry.map_or(true, |at| at.elapsed() >= refresh.telemetry_interval()) {
                self.report_item_counts().await;
                last_telemetry = Some(Instant::now());
            }
        }
    }

    // Cancellation short-circuits; any other failure is reported and kept so the remaining caches still get their turn.
    async fn note_failure(
        &self,
        cache: &Cache<K, V>,
        outcome: Result<()>,
        first_failure: &mut Option<CacheError>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                let message = format!("refresh of {} failed: {err}", cache.name());
                if let Err(sink_err) = self.observer.on_warning(&message).await {
                    trace!("observer failed to take a warning: {sink_err}");
                }
                first_failure.get_or_insert(err);
                Ok(())
            }
        }
    }

    #[instrument(level = "trace", skip(self))]
    async fn report_item_counts(&self) {
        let report = ItemCountReport {
            counts:         self.item_counts(),
            process_memory: process_memory(),
        };
        info!(
            total = report.total(),
            memory = ?report.process_memory,
            "cache item counts"
        );
        if let Err(err) = self.observer.on_item_counts(&report).await {
            trace!("observer failed to take item counts: {err}");
        }
    }
}

impl<K, V> std::fmt::Debug for CacheRegistry<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("caches", &self.caches)
            .field("refresh", self.config.refresh())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Resident memory of the current process in bytes.
pub fn process_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_process(pid);
    system.process(pid).map(|process| process.memory())
}
