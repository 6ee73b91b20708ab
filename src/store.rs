//! In-process time-ordered storage.
//!
//! Keys are kept sorted by `(time_logged, time_stamp)` with the row identity as the final tie-breaker, so that the
//! backing map has a total order consistent with key equality. Uniqueness, however, is decided by identity alone: a
//! row that is fetched twice with different timestamps is still stored once.
//!
//! The store does no locking of its own. The owning [`Cache`](crate::cache::Cache) serializes all access.

use std::collections::BTreeMap;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;

use crate::traits::CacheKey;
use crate::traits::CacheValue;
use crate::types::EPOCH_MIN;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    time_logged:   DateTime<Utc>,
    time_stamp:    DateTime<Utc>,
    partition_key: String,
    row_key:       String,
}

impl SortKey {
    fn of<K: CacheKey>(key: &K) -> Self {
        Self {
            time_logged:   key.time_logged(),
            time_stamp:    key.time_stamp(),
            partition_key: key.partition_key().to_string(),
            row_key:       key.row_key().to_string(),
        }
    }

    // The smallest possible sort key logged at `instant`.
    fn lower_bound(instant: DateTime<Utc>) -> Self {
        Self {
            time_logged:   instant,
            time_stamp:    EPOCH_MIN,
            partition_key: String::new(),
            row_key:       String::new(),
        }
    }

    fn identity(&self) -> (String, String) {
        (self.partition_key.clone(), self.row_key.clone())
    }
}

/// Result of a count-based removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    pub count:     usize,
    /// `time_logged` of the largest removed key.
    pub last_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct TimeOrderedStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    entries:    BTreeMap<SortKey, (K, V)>,
    identities: HashSet<(String, String)>,
}

impl<K, V> TimeOrderedStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new() -> Self {
        Self {
            entries:    BTreeMap::new(),
            identities: HashSet::new(),
        }
    }

    /// Insert one entry unless a key with the same identity is already there. First write wins.
    pub fn store(&mut self, key: K, value: V) -> bool {
        let sort_key = SortKey::of(&key);
        if !self.identities.insert(sort_key.identity()) {
            return false;
        }
        self.entries.insert(sort_key, (key, value));
        true
    }

    /// Bulk variant of [`store`](Self::store). Returns how many entries were actually inserted.
    pub fn store_all(&mut self, entries: impl IntoIterator<Item = (K, V)>) -> usize {
        entries
            .into_iter()
            .map(|(key, value)| self.store(key, value))
            .filter(|inserted| *inserted)
            .count()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.identities
            .contains(&(key.partition_key().to_string(), key.row_key().to_string()))
    }

    pub fn earliest_key(&self) -> Option<&K> {
        self.entries.first_key_value().map(|(_, (key, _))| key)
    }

    pub fn latest_key(&self) -> Option<&K> {
        self.entries.last_key_value().map(|(_, (key, _))| key)
    }

    /// Values logged within `[start, end)`, ascending by key.
    pub fn values_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<V> {
        if start >= end {
            return Vec::new();
        }

        self.entries
            .range(SortKey::lower_bound(start)..)
            .take_while(|(_, (key, _))| key.is_logged_within(start, end))
            .map(|(_, (_, value))| value.clone())
            .collect()
    }

    /// Drop every key logged before `earliest_allowed`. Walks the sorted prefix only.
    pub fn remove_old_keys(&mut self, earliest_allowed: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().0.is_logged_before(earliest_allowed) {
                break;
            }
            let (sort_key, _) = entry.remove_entry();
            self.identities.remove(&sort_key.identity());
            removed += 1;
        }
        removed
    }

    /// Drop the `count` smallest keys.
    pub fn remove_first_keys(&mut self, count: usize) -> Removed {
        let mut removed = Removed {
            count:     0,
            last_time: None,
        };

        while removed.count < count {
            let Some((sort_key, _)) = self.entries.pop_first()
            else {
                break;
            };
            self.identities.remove(&sort_key.identity());
            removed.count += 1;
            removed.last_time = Some(sort_key.time_logged);
        }

        removed
    }

    #[inline]
    pub fn item_count(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.identities.clear();
    }
}

impl<K, V> Default for TimeOrderedStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::test::event_row;
    use crate::traits::TimeComparable;
    use crate::types::EventKey;
    use crate::types::EventValue;

    type Store = TimeOrderedStore<EventKey, EventValue>;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn entry(row_key: &str, minute: i64) -> (EventKey, EventValue) {
        let logged = base() + TimeDelta::minutes(minute);
        let row = event_row("p", row_key, logged);
        (
            EventKey::from_row(&row, base(), base() + TimeDelta::days(1), base()),
            EventValue::from_row(row, base()),
        )
    }

    fn minutes(values: &[EventValue]) -> Vec<i64> {
        values
            .iter()
            .map(|v| (v.time_logged - base()).num_minutes())
            .collect()
    }

    #[test]
    fn first_write_wins() {
        let mut store = Store::new();
        let (key, value) = entry("r1", 5);
        assert!(store.store(key, value));

        // Same identity, different timing and payload.
        let (key, mut value) = entry("r1", 50);
        value.properties.insert("late".into(), "yes".into());
        assert!(!store.store(key, value));

        assert_eq!(store.item_count(), 1);
        let values = store.values_in_range(base(), base() + TimeDelta::hours(2));
        assert_eq!(minutes(&values), vec![5]);
        assert!(values[0].properties.is_empty());
    }

    #[test]
    fn overlapping_bulk_inserts_store_each_identity_once() {
        let mut store = Store::new();
        let first = store.store_all((0..10).map(|i| entry(&format!("r{i}"), i)));
        let second = store.store_all((5..15).map(|i| entry(&format!("r{i}"), i)));
        assert_eq!(first, 10);
        assert_eq!(second, 5);
        assert_eq!(store.item_count(), 15);
    }

    #[test]
    fn earliest_and_latest() {
        let mut store = Store::new();
        assert!(store.earliest_key().is_none());
        assert!(store.latest_key().is_none());

        store.store_all([entry("b", 20), entry("a", 10), entry("c", 30)]);
        assert_eq!(store.earliest_key().map(|k| k.row_key()), Some("a"));
        assert_eq!(store.latest_key().map(|k| k.row_key()), Some("c"));
    }

    #[test]
    fn range_is_half_open() {
        let mut store = Store::new();
        store.store_all((0..6).map(|i| entry(&format!("r{i}"), i * 10)));

        let values = store.values_in_range(base() + TimeDelta::minutes(10), base() + TimeDelta::minutes(40));
        assert_eq!(minutes(&values), vec![10, 20, 30]);

        assert!(store
            .values_in_range(base() + TimeDelta::minutes(40), base() + TimeDelta::minutes(40))
            .is_empty());
    }

    #[test]
    fn remove_old_keys_stops_at_boundary() {
        let mut store = Store::new();
        store.store_all((0..6).map(|i| entry(&format!("r{i}"), i * 10)));

        assert_eq!(store.remove_old_keys(base() + TimeDelta::minutes(25)), 3);
        assert_eq!(store.item_count(), 3);
        assert_eq!(
            store.earliest_key().map(|k| k.time_logged()),
            Some(base() + TimeDelta::minutes(30))
        );
        // Identity of an evicted row can be stored again.
        let (key, value) = entry("r0", 0);
        assert!(store.store(key, value));
    }

    #[test]
    fn remove_first_keys_is_bounded_by_size() {
        let mut store = Store::new();
        store.store_all((0..15).map(|i| entry(&format!("r{i}"), i)));

        let removed = store.remove_first_keys(5);
        assert_eq!(removed.count, 5);
        assert_eq!(removed.last_time, Some(base() + TimeDelta::minutes(4)));
        assert_eq!(store.item_count(), 10);

        let removed = store.remove_first_keys(100);
        assert_eq!(removed.count, 10);
        assert!(store.is_empty());
    }

    #[test]
    fn clear_twice() {
        let mut store = Store::new();
        store.store_all((0..3).map(|i| entry(&format!("r{i}"), i)));
        store.clear();
        store.clear();
        assert_eq!(store.item_count(), 0);
        assert!(!store.contains(&entry("r0", 0).0));
    }

    proptest! {
        #[test]
        fn range_read_matches_filter(
            logged in prop::collection::vec(0i64..500, 0..80),
            lo in 0i64..520,
            width in 0i64..300,
        ) {
            let mut store = Store::new();
            for (i, minute) in logged.iter().enumerate() {
                let (key, value) = entry(&format!("r{i}"), *minute);
                store.store(key, value);
            }

            let start = base() + TimeDelta::minutes(lo);
            let end = start + TimeDelta::minutes(width);
            let got = minutes(&store.values_in_range(start, end));

            let mut expected: Vec<i64> = logged.iter().copied().filter(|m| *m >= lo && *m < lo + width).collect();
            expected.sort_unstable();

            prop_assert_eq!(got, expected);
        }

        #[test]
        fn eviction_leaves_nothing_older(
            logged in prop::collection::vec(0i64..500, 0..80),
            cutoff in 0i64..520,
        ) {
            let mut store = Store::new();
            for (i, minute) in logged.iter().enumerate() {
                let (key, value) = entry(&format!("r{i}"), *minute);
                store.store(key, value);
            }
            let before = store.item_count();
            let removed = store.remove_old_keys(base() + TimeDelta::minutes(cutoff));

            prop_assert_eq!(before - removed, store.item_count());
            if let Some(earliest) = store.earliest_key() {
                prop_assert!(earliest.time_logged() >= base() + TimeDelta::minutes(cutoff));
            }
        }
    }
}
