//! Two-tier read-through cache for computed reports.
//!
//! The memory tier is bounded and evicts in insertion order. An optional
//! external tier survives process restarts; a hit there repopulates memory
//! with whatever lifetime the entry has left. Expiry is wall-clock based and
//! checked on read as well as by a periodic sweep.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::config::CacheSettings;
use crate::error::DataResult;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: Value,
    pub expires_at: DateTime<Utc>,
}

/// Backing store for the second cache tier.
pub trait ExternalStore: Send + Sync + 'static {
    fn load(&self, key: &str) -> impl Future<Output = DataResult<Option<StoredEntry>>> + Send;

    fn store(&self, key: &str, entry: &StoredEntry) -> impl Future<Output = DataResult<()>> + Send;

    fn purge_expired(&self, now: DateTime<Utc>) -> impl Future<Output = DataResult<u64>> + Send;
}

/// Placeholder tier for memory-only caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExternal;

impl ExternalStore for NoExternal {
    async fn load(&self, _key: &str) -> DataResult<Option<StoredEntry>> {
        Ok(None)
    }

    async fn store(&self, _key: &str, _entry: &StoredEntry) -> DataResult<()> {
        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> DataResult<u64> {
        Ok(0)
    }
}

pub struct TieredCache<S: ExternalStore = NoExternal> {
    memory: Mutex<IndexMap<String, StoredEntry>>,
    external: Option<S>,
    max_entries: usize,
    clock: Clock,
    sweeper: Mutex<Option<AbortHandle>>,
    refreshes: Mutex<HashMap<String, (u64, AbortHandle)>>,
    refresh_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl<S: ExternalStore> TieredCache<S> {
    pub fn new(max_entries: usize, external: Option<S>) -> Self {
        Self::with_clock(max_entries, external, Arc::new(Utc::now))
    }

    pub fn with_clock(max_entries: usize, external: Option<S>, clock: Clock) -> Self {
        Self {
            memory: Mutex::new(IndexMap::new()),
            external,
            max_entries: max_entries.max(1),
            clock,
            sweeper: Mutex::new(None),
            refreshes: Mutex::new(HashMap::new()),
            refresh_generation: AtomicU64::new(0),
        }
    }

    /// Builds the cache and starts its sweep task. Must be called inside a
    /// Tokio runtime.
    pub fn start(settings: &CacheSettings, external: Option<S>) -> Arc<Self> {
        let cache = Arc::new(Self::new(settings.max_entries, external));
        cache.start_sweeper(Duration::from_secs(settings.sweep_interval_secs));
        cache
    }

    pub fn len(&self) -> usize {
        lock(&self.memory).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.memory).is_empty()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn insert_memory(&self, key: &str, entry: StoredEntry) {
        let mut memory = lock(&self.memory);
        if !memory.contains_key(key) {
            while memory.len() >= self.max_entries {
                if let Some((evicted, _)) = memory.shift_remove_index(0) {
                    debug!("cache: evicted {evicted}");
                }
            }
        }
        memory.insert(key.to_string(), entry);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = self.now();
        {
            let mut memory = lock(&self.memory);
            if let Some(entry) = memory.get(key) {
                if entry.expires_at > now {
                    debug!("cache: memory hit {key}");
                    return Some(entry.value.clone());
                }
                memory.shift_remove(key);
            }
        }

        let external = self.external.as_ref()?;
        match external.load(key).await {
            Ok(Some(entry)) if entry.expires_at > now => {
                debug!("cache: external hit {key}");
                let value = entry.value.clone();
                self.insert_memory(key, entry);
                Some(value)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("cache: external lookup for {key} failed: {err}");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Duration) {
        let entry = StoredEntry {
            value,
            expires_at: expiry(self.now(), ttl),
        };
        if let Some(external) = self.external.as_ref() {
            if let Err(err) = external.store(key, &entry).await {
                warn!("cache: external write for {key} failed: {err}");
            }
        }
        self.insert_memory(key, entry);
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!("cache: discarding undecodable entry {key}: {err}");
                lock(&self.memory).shift_remove(key);
                None
            }
        }
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(encoded) => self.set(key, encoded, ttl).await,
            Err(err) => warn!("cache: could not encode {key}: {err}"),
        }
    }

    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> DataResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        if let Some(cached) = self.get_as::<T>(key).await {
            return Ok(cached);
        }
        debug!("cache: miss {key}");
        let fresh = fetch().await?;
        self.set_as(key, &fresh, ttl).await;
        Ok(fresh)
    }

    /// Removes expired memory entries and asks the external tier to do the
    /// same. Returns the number of memory entries dropped.
    pub async fn sweep(&self) -> usize {
        let now = self.now();
        let removed = {
            let mut memory = lock(&self.memory);
            let before = memory.len();
            memory.retain(|_, entry| entry.expires_at > now);
            before - memory.len()
        };
        if let Some(external) = self.external.as_ref() {
            match external.purge_expired(now).await {
                Ok(purged) if purged > 0 => debug!("cache: purged {purged} external entries"),
                Ok(_) => {}
                Err(err) => warn!("cache: external purge failed: {err}"),
            }
        }
        removed
    }
}

impl<S: ExternalStore> TieredCache<S> {
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.sweep().await;
                if removed > 0 {
                    debug!("cache: sweep removed {removed} entries");
                }
            }
        });
        if let Some(previous) = lock(&self.sweeper).replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Refetches `key` after `delay` without blocking the caller. A newer
    /// refresh for the same key replaces a pending one.
    pub fn schedule_refresh<T, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: Duration,
        delay: Duration,
        fetch: F,
    )
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DataResult<T>> + Send + 'static,
    {
        let generation = self.refresh_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let weak: Weak<Self> = Arc::downgrade(self);
        let task_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fresh = match fetch().await {
                Ok(fresh) => fresh,
                Err(err) => {
                    warn!("cache: background refresh of {task_key} failed: {err}");
                    return;
                }
            };
            let value = match serde_json::to_value(&fresh) {
                Ok(value) => value,
                Err(err) => {
                    warn!("cache: could not encode {task_key}: {err}");
                    return;
                }
            };
            let Some(cache) = weak.upgrade() else {
                return;
            };
            cache.set(&task_key, value, ttl).await;
            debug!("cache: refreshed {task_key}");
            let mut refreshes = lock(&cache.refreshes);
            if refreshes.get(&task_key).map(|(current, _)| *current) == Some(generation) {
                refreshes.remove(&task_key);
            }
        });

        let previous =
            lock(&self.refreshes).insert(key.to_string(), (generation, handle.abort_handle()));
        if let Some((_, pending)) = previous {
            debug!("cache: superseding pending refresh of {key}");
            pending.abort();
        }
    }
}

impl<S: ExternalStore> TieredCache<S> {
    pub fn refresh_pending(&self, key: &str) -> bool {
        lock(&self.refreshes)
            .get(key)
            .is_some_and(|(_, pending)| !pending.is_finished())
    }

    /// Like `schedule_refresh`, but leaves a pending refresh for `key` in
    /// place. Returns whether a new refresh was scheduled.
    pub fn ensure_refresh<T, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        ttl: Duration,
        delay: Duration,
        fetch: F,
    ) -> bool
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DataResult<T>> + Send + 'static,
    {
        if self.refresh_pending(key) {
            return false;
        }
        self.schedule_refresh(key, ttl, delay, fetch);
        true
    }
}

impl<S: ExternalStore> Drop for TieredCache<S> {
    fn drop(&mut self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
        for (_, (_, pending)) in lock(&self.refreshes).drain() {
            pending.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Utc::now())))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::from_std(by).unwrap();
        }

        fn clock(&self) -> Clock {
            let inner = self.0.clone();
            Arc::new(move || *inner.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct MapStore {
        entries: Mutex<HashMap<String, StoredEntry>>,
        fail: bool,
    }

    impl ExternalStore for Arc<MapStore> {
        async fn load(&self, key: &str) -> DataResult<Option<StoredEntry>> {
            if self.fail {
                return Err(DataError::network("connection refused"));
            }
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn store(&self, key: &str, entry: &StoredEntry) -> DataResult<()> {
            if self.fail {
                return Err(DataError::network("connection refused"));
            }
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), entry.clone());
            Ok(())
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> DataResult<u64> {
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at > now);
            Ok((before - entries.len()) as u64)
        }
    }

    fn memory_cache(max_entries: usize, clock: &ManualClock) -> TieredCache {
        TieredCache::with_clock(max_entries, None, clock.clock())
    }

    #[tokio::test]
    async fn set_then_get_until_ttl_elapses() {
        let clock = ManualClock::new();
        let cache = memory_cache(8, &clock);
        cache
            .set("attendance:school-a", json!({"rate": 75}), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("attendance:school-a").await, Some(json!({"rate": 75})));

        clock.advance(Duration::from_secs(59));
        assert!(cache.get("attendance:school-a").await.is_some());

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("attendance:school-a").await, None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn evicts_in_insertion_order() {
        let clock = ManualClock::new();
        let cache = memory_cache(2, &clock);
        let ttl = Duration::from_secs(60);
        cache.set("a", json!(1), ttl).await;
        cache.set("b", json!(2), ttl).await;
        // Reading does not refresh position.
        assert!(cache.get("a").await.is_some());
        cache.set("c", json!(3), ttl).await;

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(json!(2)));
        assert_eq!(cache.get("c").await, Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn updating_a_key_keeps_its_slot() {
        let clock = ManualClock::new();
        let cache = memory_cache(2, &clock);
        let ttl = Duration::from_secs(60);
        cache.set("a", json!(1), ttl).await;
        cache.set("b", json!(2), ttl).await;
        cache.set("a", json!(10), ttl).await;
        cache.set("c", json!(3), ttl).await;

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn external_hit_repopulates_memory() {
        let clock = ManualClock::new();
        let store = Arc::new(MapStore::default());
        store.entries.lock().unwrap().insert(
            "fees:school-a".to_string(),
            StoredEntry {
                value: json!({"collected": 1200}),
                expires_at: (clock.clock())() + chrono::Duration::seconds(30),
            },
        );
        let cache = TieredCache::with_clock(8, Some(store.clone()), clock.clock());

        assert!(cache.is_empty());
        assert_eq!(cache.get("fees:school-a").await, Some(json!({"collected": 1200})));
        assert_eq!(cache.len(), 1);

        store.entries.lock().unwrap().clear();
        assert!(cache.get("fees:school-a").await.is_some());

        clock.advance(Duration::from_secs(31));
        assert_eq!(cache.get("fees:school-a").await, None);
    }

    #[tokio::test]
    async fn set_writes_both_tiers() {
        let clock = ManualClock::new();
        let store = Arc::new(MapStore::default());
        let cache = TieredCache::with_clock(8, Some(store.clone()), clock.clock());
        cache.set("k", json!("v"), Duration::from_secs(5)).await;
        assert!(store.entries.lock().unwrap().contains_key("k"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn external_failures_are_misses() {
        let clock = ManualClock::new();
        let store = Arc::new(MapStore {
            fail: true,
            ..MapStore::default()
        });
        let cache = TieredCache::with_clock(8, Some(store), clock.clock());
        assert_eq!(cache.get("missing").await, None);
        cache.set("k", json!(1), Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries() {
        let clock = ManualClock::new();
        let store = Arc::new(MapStore::default());
        let cache = TieredCache::with_clock(8, Some(store.clone()), clock.clock());
        cache.set("short", json!(1), Duration::from_secs(10)).await;
        cache.set("long", json!(2), Duration::from_secs(100)).await;

        clock.advance(Duration::from_secs(20));
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(store.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_or_fetch_only_fetches_on_miss() {
        let clock = ManualClock::new();
        let cache = memory_cache(8, &clock);
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let fetch = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DataError>(vec![75u32, 80])
        };

        let first: Vec<u32> = cache
            .get_or_fetch("weekly", Duration::from_secs(60), fetch)
            .await
            .unwrap();
        let second: Vec<u32> = cache
            .get_or_fetch("weekly", Duration::from_secs(60), fetch)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_fetch_propagates_fetch_errors() {
        let clock = ManualClock::new();
        let cache = memory_cache(8, &clock);
        let result: DataResult<u32> = cache
            .get_or_fetch("k", Duration::from_secs(1), || async {
                Err(DataError::rejected("permission denied for table fees"))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_refresh_supersedes_pending_one() {
        let cache = Arc::new(TieredCache::<NoExternal>::new(8, None));
        let ttl = Duration::from_secs(300);
        cache.schedule_refresh("report", ttl, Duration::from_secs(5), || async {
            Ok::<_, DataError>(json!("stale"))
        });
        cache.schedule_refresh("report", ttl, Duration::from_secs(5), || async {
            Ok::<_, DataError>(json!("fresh"))
        });

        assert_eq!(cache.get("report").await, None);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.get("report").await, Some(json!("fresh")));
        assert!(lock(&cache.refreshes).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_lands_when_ticks_outpace_its_delay() {
        let cache = Arc::new(TieredCache::<NoExternal>::new(8, None));
        let ttl = Duration::from_secs(300);
        let delay = ttl.mul_f64(0.8);
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduled = 0;

        for _ in 0..10 {
            let counter = runs.clone();
            if cache.ensure_refresh("report", ttl, delay, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DataError>(json!({"rate": 91}))
            }) {
                scheduled += 1;
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        assert_eq!(cache.get("report").await, Some(json!({"rate": 91})));
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert!(scheduled < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_does_not_block_the_next_one() {
        let cache = Arc::new(TieredCache::<NoExternal>::new(8, None));
        let ttl = Duration::from_secs(60);
        assert!(cache.ensure_refresh("fees", ttl, Duration::from_secs(1), || async {
            Err::<u32, _>(DataError::network("connection reset"))
        }));
        assert!(cache.refresh_pending("fees"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!cache.refresh_pending("fees"));
        assert!(cache.ensure_refresh("fees", ttl, Duration::from_secs(1), || async {
            Ok::<_, DataError>(7u32)
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_interval() {
        let clock = ManualClock::new();
        let cache = Arc::new(memory_cache(8, &clock));
        cache.set("k", json!(1), Duration::from_secs(1)).await;
        cache.start_sweeper(Duration::from_secs(30));

        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.is_empty());
    }
}
