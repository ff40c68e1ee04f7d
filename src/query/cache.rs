use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::{
    sync::{watch, Notify},
    time::Instant,
};

use super::{observer, Query, QueryOptions, QueryState};
use crate::{Error, Result};

/// Asynchronous function producing the value of a query.
pub type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

struct CacheEntry<T> {
    value: T,
    written_at: Instant,
    updated_at: DateTime<Utc>,
    generation: u64,
}

struct InFlight<T> {
    id: u64,
    fetch: SharedFetch<T>,
}

struct Subscriber<T> {
    id: u64,
    notify: Arc<Notify>,
    state: watch::Sender<QueryState<T>>,
    options: QueryOptions,
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    in_flight: HashMap<String, InFlight<T>>,
    subscribers: HashMap<String, Vec<Subscriber<T>>>,
    /// Source of entry generations, fetch ids and subscriber ids.
    next_id: u64,
}

impl<T> CacheInner<T> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn subscribers_of(&self, key: &str) -> impl Iterator<Item = &Subscriber<T>> {
        self.subscribers.get(key).into_iter().flatten()
    }
}

/// An in-memory cache of asynchronously produced values.
///
/// `QueryCache` is cheap to clone: clones share the same entries, so it can be handed to every
/// consumer of one client.
///
/// - Entries younger than [`QueryOptions::stale_time`] are served without fetching.
/// - Stale entries are served immediately while a background refetch runs.
/// - Concurrent requests for the same key share a single in-flight fetch.
/// - Entries are evicted [`QueryOptions::cache_time`] after they were last written, unless a
///   fetch for the key is in flight.
/// - Invalidation removes entries and makes every active [`Query`] of the affected keys refetch.
pub struct QueryCache<T> {
    inner: Arc<Mutex<CacheInner<T>>>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        QueryCache {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for QueryCache<T> {
    fn default() -> Self {
        QueryCache {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                subscribers: HashMap::new(),
                next_id: 0,
            })),
        }
    }
}

impl<T> fmt::Debug for QueryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("QueryCache")
            .field("entries", &inner.entries.len())
            .field("in_flight", &inner.in_flight.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl<T> QueryCache<T> {
    fn lock(&self) -> MutexGuard<'_, CacheInner<T>> {
        // Every critical section leaves the maps consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn unsubscribe(&self, key: &str, id: u64) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(key) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                inner.subscribers.remove(key);
            }
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Returns `true` if a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &str) -> bool {
        self.lock().in_flight.contains_key(key)
    }

    /// When the entry for `key` was last written.
    pub fn updated_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.lock().entries.get(key).map(|entry| entry.updated_at)
    }

    /// Returns `true` if there is no entry for `key` or it is older than `stale_time`.
    pub fn is_stale(&self, key: &str, stale_time: Duration) -> bool {
        self.lock()
            .entries
            .get(key)
            .map_or(true, |entry| entry.written_at.elapsed() >= stale_time)
    }

    /// Drop all entries without notifying subscribers.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.in_flight.clear();
    }

    /// Remove the entry for `key` and make its subscribers refetch. Returns the number of
    /// removed entries.
    pub fn invalidate(&self, key: &str) -> usize {
        self.invalidate_matching(|k| k == key)
    }

    /// Remove all entries whose key starts with `prefix` and make their subscribers refetch.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        self.invalidate_matching(|k| k.starts_with(prefix))
    }

    /// Remove all entries whose key matches `predicate` and make their subscribers refetch.
    ///
    /// Fetches in flight for matching keys are detached: they still resolve for their callers
    /// but their results are not written to the cache.
    pub fn invalidate_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.lock();

        let before = inner.entries.len();
        inner.entries.retain(|key, _| !predicate(key));
        let removed = before - inner.entries.len();
        inner.in_flight.retain(|key, _| !predicate(key));

        let mut notified = 0;
        for (_, subscribers) in inner.subscribers.iter().filter(|(key, _)| predicate(key)) {
            for subscriber in subscribers.iter().filter(|s| s.options.enabled) {
                subscriber.notify.notify_one();
                notified += 1;
            }
        }

        log::debug!(target: "feature_client",
                    removed,
                    notified;
                    "invalidated cache entries");
        removed
    }
}

impl<T: Clone + Send + Sync + 'static> QueryCache<T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        QueryCache::default()
    }

    /// Cached value for `key`, fresh or stale.
    pub fn get(&self, key: &str) -> Option<T> {
        self.lock().entries.get(key).map(|entry| entry.value.clone())
    }

    /// Write `value` for `key`, publishing it to subscribers. The entry is evicted after
    /// `cache_time` unless written again.
    pub fn set(&self, key: &str, value: T, cache_time: Duration) {
        let mut inner = self.lock();
        self.write(&mut inner, key, value, cache_time);
    }

    /// Resolve `key`.
    ///
    /// A fresh entry is returned without calling `fetcher`. A stale entry is returned
    /// immediately and refreshed in the background. Without an entry, the call waits for
    /// `fetcher` (or for the fetch already in flight for `key`).
    pub async fn fetch(&self, key: &str, fetcher: QueryFn<T>, options: &QueryOptions) -> Result<T> {
        let cached = self.lock().entries.get(key).map(|entry| {
            (
                entry.value.clone(),
                entry.written_at.elapsed() < options.stale_time,
            )
        });

        match cached {
            Some((value, true)) => {
                log::trace!(target: "feature_client", key; "serving fresh cache entry");
                Ok(value)
            }
            Some((value, false)) => {
                log::debug!(target: "feature_client", key; "serving stale cache entry, revalidating");
                let refresh = self.start_fetch(key, fetcher, options);
                let key = key.to_owned();
                tokio::spawn(async move {
                    // The stale value stays cached; subscribers see the failure.
                    if let Err(err) = refresh.await {
                        log::warn!(target: "feature_client",
                                   key:display = key;
                                   "background revalidation failed: {}", err);
                    }
                });
                Ok(value)
            }
            None => self.start_fetch(key, fetcher, options).await,
        }
    }

    /// Fetch `key` regardless of freshness, joining a fetch already in flight.
    pub async fn refresh(
        &self,
        key: &str,
        fetcher: QueryFn<T>,
        options: &QueryOptions,
    ) -> Result<T> {
        self.start_fetch(key, fetcher, options).await
    }

    /// Called when the application regains focus. Every enabled subscriber with
    /// [`QueryOptions::refetch_on_window_focus`] whose data is stale refetches. Returns the
    /// number of triggered refetches.
    pub fn focus_gained(&self) -> usize {
        let inner = self.lock();
        let mut triggered = 0;

        for (key, subscribers) in &inner.subscribers {
            let age = inner.entries.get(key).map(|entry| entry.written_at.elapsed());
            for subscriber in subscribers {
                let options = &subscriber.options;
                let stale = age.map_or(true, |age| age >= options.stale_time);
                if options.enabled && options.refetch_on_window_focus && stale {
                    subscriber.notify.notify_one();
                    triggered += 1;
                }
            }
        }

        triggered
    }

    /// Create a reactive [`Query`] for `key`.
    ///
    /// The query observes every write to `key` (including writes caused by other consumers),
    /// refetches when the key is invalidated or on focus, and stops when dropped.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        key: impl Into<String>,
        fetcher: QueryFn<T>,
        options: QueryOptions,
    ) -> Query<T> {
        let key = key.into();
        let notify = Arc::new(Notify::new());

        let (id, state) = {
            let mut inner = self.lock();

            let initial = match inner.entries.get(&key) {
                Some(entry) => {
                    let fresh = entry.written_at.elapsed() < options.stale_time;
                    let refetch = options.enabled && !fresh;
                    if refetch {
                        notify.notify_one();
                    }
                    QueryState::cached(entry.value.clone(), entry.updated_at, refetch)
                }
                None if options.enabled => {
                    notify.notify_one();
                    QueryState::loading()
                }
                None => QueryState::idle(),
            };

            let (sender, receiver) = watch::channel(initial);
            let id = inner.next_id();
            inner
                .subscribers
                .entry(key.clone())
                .or_default()
                .push(Subscriber {
                    id,
                    notify: notify.clone(),
                    state: sender,
                    options: options.clone(),
                });
            (id, receiver)
        };

        let worker = tokio::spawn(observer::run(
            self.clone(),
            key.clone(),
            fetcher,
            options,
            notify.clone(),
        ));

        Query::new(key, id, self.clone(), notify, state, worker)
    }

    fn start_fetch(&self, key: &str, fetcher: QueryFn<T>, options: &QueryOptions) -> SharedFetch<T> {
        let mut inner = self.lock();

        if let Some(pending) = inner.in_flight.get(key) {
            log::trace!(target: "feature_client", key; "joining in-flight fetch");
            return pending.fetch.clone();
        }

        let id = inner.next_id();
        let cache = Arc::downgrade(&self.inner);
        let owned_key = key.to_owned();
        let options = options.clone();

        // The fetch runs on its own task so that it completes even if every waiter is dropped.
        let driver = tokio::spawn(async move {
            let result = run_with_retry(&fetcher, &options).await;
            if let Some(inner) = cache.upgrade() {
                QueryCache { inner }.complete(&owned_key, id, &result, options.cache_time);
            }
            result
        });
        let fetch = async move {
            match driver.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(Error::Cancelled),
            }
        }
        .boxed()
        .shared();

        inner.in_flight.insert(
            key.to_owned(),
            InFlight {
                id,
                fetch: fetch.clone(),
            },
        );
        for subscriber in inner.subscribers_of(key) {
            subscriber.state.send_modify(QueryState::start_fetching);
        }

        fetch
    }

    fn complete(&self, key: &str, fetch_id: u64, result: &Result<T>, cache_time: Duration) {
        let mut inner = self.lock();

        let current = matches!(inner.in_flight.get(key), Some(pending) if pending.id == fetch_id);
        if !current {
            log::debug!(target: "feature_client", key; "discarding result of invalidated fetch");
            return;
        }
        inner.in_flight.remove(key);

        match result {
            Ok(value) => self.write(&mut inner, key, value.clone(), cache_time),
            Err(err) => {
                for subscriber in inner.subscribers_of(key) {
                    subscriber.state.send_modify(|state| state.fail(err.clone()));
                }
            }
        }
    }

    fn write(&self, inner: &mut CacheInner<T>, key: &str, value: T, cache_time: Duration) {
        let generation = inner.next_id();
        let updated_at = Utc::now();

        for subscriber in inner.subscribers_of(key) {
            subscriber
                .state
                .send_modify(|state| state.succeed(value.clone(), updated_at));
        }
        inner.entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                written_at: Instant::now(),
                updated_at,
                generation,
            },
        );

        self.schedule_eviction(key, generation, cache_time);
    }

    fn schedule_eviction(&self, key: &str, generation: u64, cache_time: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!(target: "feature_client", key; "no async runtime, cache entry will not expire");
            return;
        };

        let cache = Arc::downgrade(&self.inner);
        let key = key.to_owned();
        runtime.spawn(async move {
            tokio::time::sleep(cache_time).await;

            let Some(inner) = cache.upgrade() else {
                return;
            };
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.in_flight.contains_key(&key) {
                return;
            }
            let expired = inner
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if expired {
                inner.entries.remove(&key);
                log::trace!(target: "feature_client", key; "evicted cache entry");
            }
        });
    }
}

/// Run `fetcher`, retrying the whole function with a linearly growing delay.
async fn run_with_retry<T>(fetcher: &QueryFn<T>, options: &QueryOptions) -> Result<T> {
    let max_runs = options.retry.max_runs();
    let mut run = 1;

    loop {
        match fetcher().await {
            Ok(value) => return Ok(value),
            Err(err) if run < max_runs && !err.is_contract_violation() => {
                let delay = options.retry_delay.saturating_mul(run);
                log::debug!(target: "feature_client",
                            run,
                            delay_ms = delay.as_millis() as u64;
                            "query failed, retrying: {}", err);
                tokio::time::sleep(delay).await;
                run += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_fetcher(calls: Arc<AtomicU32>) -> QueryFn<u32> {
        Arc::new(move || {
            let calls = calls.clone();
            async move {
                // Yield so that concurrent callers can observe the in-flight fetch.
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }
            .boxed()
        })
    }

    fn failing_fetcher(calls: Arc<AtomicU32>) -> QueryFn<u32> {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::Http {
                    status: 503,
                    status_text: "Service Unavailable".into(),
                })
            }
            .boxed()
        })
    }

    fn fresh_for(stale_time: Duration) -> QueryOptions {
        QueryOptions::new().with_stale_time(stale_time)
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_skips_fetch() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = fresh_for(Duration::from_secs(60));

        let first = cache
            .fetch("k", counting_fetcher(calls.clone()), &options)
            .await
            .unwrap();
        let second = cache
            .fetch("k", counting_fetcher(calls.clone()), &options)
            .await
            .unwrap();

        assert_eq!((first, second), (1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_share_one_request() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new();

        let (a, b, c) = tokio::join!(
            cache.fetch("k", counting_fetcher(calls.clone()), &options),
            cache.fetch("k", counting_fetcher(calls.clone()), &options),
            cache.fetch("k", counting_fetcher(calls.clone()), &options),
        );

        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_fetching("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_served_while_revalidating() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = fresh_for(Duration::from_secs(1));

        cache
            .fetch("k", counting_fetcher(calls.clone()), &options)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stale = cache
            .fetch("k", counting_fetcher(calls.clone()), &options)
            .await
            .unwrap();
        assert_eq!(stale, 1);
        assert!(cache.is_fetching("k"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_cache_time() {
        let cache = QueryCache::new();
        cache.set("k", 1u32, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        cache.set("k", 2, Duration::from_secs(10));

        // The first timer fired but the entry was rewritten in the meantime.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k"), Some(2));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn query_retry_uses_linear_delay() {
        let cache = QueryCache::<u32>::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new()
            .with_retry(2)
            .with_retry_delay(Duration::from_millis(100));
        let started = Instant::now();

        let result = cache
            .fetch("k", failing_fetcher(calls.clone()), &options)
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms after the first run, 200ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_by_prefix_removes_matching_entries() {
        let cache = QueryCache::new();
        cache.set("features:a", 1u32, Duration::from_secs(60));
        cache.set("features:b", 2, Duration::from_secs(60));
        cache.set("other", 3, Duration::from_secs(60));

        assert_eq!(cache.invalidate_by_prefix("features:"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate("other"), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_fetch_is_not_cached() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new();

        let pending = cache.fetch("k", counting_fetcher(calls.clone()), &options);
        let invalidate = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            cache.invalidate("k");
        };
        let (result, ()) = tokio::join!(pending, invalidate);

        assert_eq!(result.unwrap(), 1);
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_fetch_still_completes() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            cache.fetch("k", counting_fetcher(calls.clone()), &options),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(cache.is_fetching("k"));

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!cache.is_fetching("k"));
        assert_eq!(cache.get("k"), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_revalidation_keeps_stale_value() {
        let cache = QueryCache::new();
        cache.set("k", 1u32, Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));
        let options = fresh_for(Duration::ZERO);

        let value = cache
            .fetch("k", failing_fetcher(calls.clone()), &options)
            .await
            .unwrap();
        assert_eq!(value, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_fetching("k"));
        assert_eq!(cache.get("k"), Some(1));
    }
}
