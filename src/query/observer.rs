use std::sync::Arc;

use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};

use super::{QueryCache, QueryFn, QueryOptions, QueryState};

/// A reactive handle over one [`QueryCache`] key, created with [`QueryCache::subscribe`].
///
/// The handle owns a background worker that refetches the key whenever it is invalidated, when
/// focus is regained while the data is stale, or when [`Query::refetch`] is called. Every
/// write to the key is published to the handle, including writes made by other consumers of
/// the same cache.
///
/// Dropping the handle stops the worker and unsubscribes from the cache. A fetch shared with
/// other consumers keeps running for them.
pub struct Query<T> {
    key: String,
    id: u64,
    cache: QueryCache<T>,
    notify: Arc<Notify>,
    state: watch::Receiver<QueryState<T>>,
    worker: JoinHandle<()>,
}

impl<T> Query<T> {
    pub(super) fn new(
        key: String,
        id: u64,
        cache: QueryCache<T>,
        notify: Arc<Notify>,
        state: watch::Receiver<QueryState<T>>,
        worker: JoinHandle<()>,
    ) -> Query<T> {
        Query {
            key,
            id,
            cache,
            notify,
            state,
            worker,
        }
    }

    /// Cache key observed by this query.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<T: Clone> Query<T> {
    /// Current state snapshot.
    pub fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    /// Wait until the state changes after the last call to `changed` and return the new
    /// state.
    pub async fn changed(&mut self) -> QueryState<T> {
        // The sender lives in the cache, which this handle keeps alive.
        let _ = self.state.changed().await;
        self.state.borrow_and_update().clone()
    }

    /// Wait until no fetch is running and return the resulting state.
    pub async fn settled(&self) -> QueryState<T> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|state| !state.is_fetching)
            .await
            .map(|state| state.clone());
        settled.unwrap_or_else(|_| self.state())
    }

    /// Refetch regardless of freshness and wait for the result.
    ///
    /// Works for disabled queries too. If a fetch for the key is already running, waits for
    /// that one instead of starting another.
    pub async fn refetch(&self) -> QueryState<T> {
        let mut state = self.state.clone();
        let revision = state.borrow_and_update().revision;
        self.notify.notify_one();

        let settled = state
            .wait_for(|state| state.revision > revision)
            .await
            .map(|state| state.clone());
        settled.unwrap_or_else(|_| self.state())
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        self.worker.abort();
        self.cache.unsubscribe(&self.key, self.id);
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("key", &self.key).finish()
    }
}

/// Worker loop of a [`Query`]: refetch every time the query is woken up.
pub(super) async fn run<T: Clone + Send + Sync + 'static>(
    cache: QueryCache<T>,
    key: String,
    fetcher: QueryFn<T>,
    options: QueryOptions,
    notify: Arc<Notify>,
) {
    loop {
        notify.notified().await;
        log::trace!(target: "feature_client", key:display = key; "query woken up, refetching");
        // The outcome is published to subscribers by the cache.
        let _ = cache.refresh(&key, fetcher.clone(), &options).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use futures::FutureExt;

    use super::*;
    use crate::query::QueryStatus;

    fn counting_fetcher(calls: Arc<AtomicU32>) -> QueryFn<u32> {
        Arc::new(move || {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }
            .boxed()
        })
    }

    async fn next_settled(query: &mut Query<u32>) -> QueryState<u32> {
        loop {
            let state = query.changed().await;
            if !state.is_fetching {
                return state;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loads_then_succeeds() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        let query = cache.subscribe("k", counting_fetcher(calls.clone()), QueryOptions::new());
        assert!(query.state().is_loading());
        assert!(query.state().is_fetching);

        let state = query.settled().await;
        assert!(state.is_success());
        assert_eq!(state.data, Some(1));
        assert_eq!(cache.get("k"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_entry_is_used_without_fetching() {
        let cache = QueryCache::new();
        cache.set("k", 7u32, Duration::from_secs(60));
        let calls = Arc::new(AtomicU32::new(0));

        let query = cache.subscribe(
            "k",
            counting_fetcher(calls.clone()),
            QueryOptions::new().with_stale_time(Duration::from_secs(30)),
        );

        let state = query.state();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(7));
        assert!(!state.is_fetching);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_refetches_automatically() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new().with_stale_time(Duration::from_secs(60));

        let mut query = cache.subscribe("feature-x", counting_fetcher(calls.clone()), options);
        assert_eq!(next_settled(&mut query).await.data, Some(1));

        cache.invalidate("feature-x");

        let state = next_settled(&mut query).await;
        assert_eq!(state.data, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn focus_refetches_only_stale_queries() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        let query = cache.subscribe(
            "k",
            counting_fetcher(calls.clone()),
            QueryOptions::new().with_stale_time(Duration::from_secs(1)),
        );
        query.settled().await;

        assert_eq!(cache.focus_gained(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.focus_gained(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(query.state().data, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_query_stays_idle_until_refetched() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        let query = cache.subscribe(
            "k",
            counting_fetcher(calls.clone()),
            QueryOptions::new().with_enabled(false),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(query.state().is_idle());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let state = query.refetch().await;
        assert!(state.is_success());
        assert_eq!(state.data, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_query_unsubscribes() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        let query = cache.subscribe("k", counting_fetcher(calls.clone()), QueryOptions::new());
        query.settled().await;
        drop(query);

        cache.invalidate("k");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_share_fetches() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache.subscribe("k", counting_fetcher(calls.clone()), QueryOptions::new());
        let second = cache.subscribe("k", counting_fetcher(calls.clone()), QueryOptions::new());

        let (a, b) = tokio::join!(first.settled(), second.settled());

        assert_eq!((a.data, b.data), (Some(1), Some(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_query_mid_refresh_does_not_stall_others() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache.subscribe("k", counting_fetcher(calls.clone()), QueryOptions::new());
        assert_eq!(first.settled().await.data, Some(1));

        // The entry is already stale, so the second query starts a refresh.
        let second = cache.subscribe("k", counting_fetcher(calls.clone()), QueryOptions::new());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(first.state().is_fetching);
        drop(second);

        let state = tokio::time::timeout(Duration::from_secs(1), first.settled())
            .await
            .expect("query did not settle");
        assert_eq!(state.data, Some(2));
        assert!(!cache.is_fetching("k"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
