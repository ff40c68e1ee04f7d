use std::time::Duration;

/// Whole-query retry policy. Independent of (and composed with) the network-level
/// [`RetryPolicy`](crate::retry::RetryPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryRetry {
    /// Run the query function once.
    #[default]
    Disabled,
    /// Retry up to `n` times after the first failure.
    Attempts(u32),
}

impl QueryRetry {
    /// Retries used when retry is enabled with `true`.
    pub const DEFAULT_RETRIES: u32 = 3;

    /// Total number of runs, including the first one.
    pub fn max_runs(self) -> u32 {
        match self {
            QueryRetry::Disabled => 1,
            QueryRetry::Attempts(n) => n.saturating_add(1),
        }
    }
}

impl From<bool> for QueryRetry {
    fn from(value: bool) -> Self {
        if value {
            QueryRetry::Attempts(Self::DEFAULT_RETRIES)
        } else {
            QueryRetry::Disabled
        }
    }
}

impl From<u32> for QueryRetry {
    fn from(value: u32) -> Self {
        match value {
            0 => QueryRetry::Disabled,
            n => QueryRetry::Attempts(n),
        }
    }
}

/// Options of a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long cached data is considered fresh. Fresh data is served without fetching; stale
    /// data is served immediately while a background refetch runs.
    pub stale_time: Duration,
    /// How long an entry stays in the cache after it was last written.
    pub cache_time: Duration,
    /// Whole-query retry.
    pub retry: QueryRetry,
    /// Base delay between query retries. The n-th retry waits `retry_delay * n`.
    pub retry_delay: Duration,
    /// Refetch stale data when [`QueryCache::focus_gained`](super::QueryCache::focus_gained)
    /// is called.
    pub refetch_on_window_focus: bool,
    /// Disabled queries stay idle until refetched explicitly.
    pub enabled: bool,
}

impl QueryOptions {
    /// Default value for [`QueryOptions::stale_time`].
    pub const DEFAULT_STALE_TIME: Duration = Duration::ZERO;
    /// Default value for [`QueryOptions::cache_time`].
    pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`QueryOptions::retry_delay`].
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

    /// Create options with default values.
    pub fn new() -> QueryOptions {
        QueryOptions::default()
    }

    /// Update [`QueryOptions::stale_time`].
    pub fn with_stale_time(mut self, stale_time: Duration) -> QueryOptions {
        self.stale_time = stale_time;
        self
    }

    /// Update [`QueryOptions::cache_time`].
    pub fn with_cache_time(mut self, cache_time: Duration) -> QueryOptions {
        self.cache_time = cache_time;
        self
    }

    /// Accepts `bool` (`true` = 3 retries) or a retry count.
    pub fn with_retry(mut self, retry: impl Into<QueryRetry>) -> QueryOptions {
        self.retry = retry.into();
        self
    }

    /// Update [`QueryOptions::retry_delay`].
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> QueryOptions {
        self.retry_delay = retry_delay;
        self
    }

    /// Update [`QueryOptions::refetch_on_window_focus`].
    pub fn with_refetch_on_window_focus(mut self, refetch: bool) -> QueryOptions {
        self.refetch_on_window_focus = refetch;
        self
    }

    /// Update [`QueryOptions::enabled`].
    pub fn with_enabled(mut self, enabled: bool) -> QueryOptions {
        self.enabled = enabled;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> QueryOptions {
        QueryOptions {
            stale_time: QueryOptions::DEFAULT_STALE_TIME,
            cache_time: QueryOptions::DEFAULT_CACHE_TIME,
            retry: QueryRetry::Disabled,
            retry_delay: QueryOptions::DEFAULT_RETRY_DELAY,
            refetch_on_window_focus: true,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_conversions() {
        assert_eq!(QueryRetry::from(true), QueryRetry::Attempts(3));
        assert_eq!(QueryRetry::from(false), QueryRetry::Disabled);
        assert_eq!(QueryRetry::from(0), QueryRetry::Disabled);
        assert_eq!(QueryRetry::from(2).max_runs(), 3);
        assert_eq!(QueryRetry::Disabled.max_runs(), 1);
    }
}
