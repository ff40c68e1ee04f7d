use chrono::{DateTime, Utc};

use crate::Error;

/// Lifecycle status of a [`Query`](super::Query).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// The query is disabled and has not been fetched.
    Idle,
    /// No data yet, the first fetch is running.
    Loading,
    /// The last fetch succeeded (or data was served from cache).
    Success,
    /// The last fetch failed.
    Error,
}

/// Snapshot of a query, as observed by consumers.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Current status.
    pub status: QueryStatus,
    /// Latest successfully fetched data. Kept when a later refetch fails.
    pub data: Option<T>,
    /// Error of the last fetch, cleared by the next success.
    pub error: Option<Error>,
    /// `true` while a fetch (initial or background) is running.
    pub is_fetching: bool,
    /// Incremented every time a fetch settles.
    pub revision: u64,
    /// When `data` was written to the cache.
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QueryState<T> {
    pub(crate) fn idle() -> Self {
        QueryState {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_fetching: false,
            revision: 0,
            updated_at: None,
        }
    }

    pub(crate) fn loading() -> Self {
        QueryState {
            status: QueryStatus::Loading,
            is_fetching: true,
            ..QueryState::idle()
        }
    }

    pub(crate) fn cached(data: T, updated_at: DateTime<Utc>, is_fetching: bool) -> Self {
        QueryState {
            status: QueryStatus::Success,
            data: Some(data),
            updated_at: Some(updated_at),
            is_fetching,
            ..QueryState::idle()
        }
    }

    pub(crate) fn start_fetching(&mut self) {
        self.is_fetching = true;
        if self.status == QueryStatus::Idle && self.data.is_none() {
            self.status = QueryStatus::Loading;
        }
    }

    pub(crate) fn succeed(&mut self, data: T, updated_at: DateTime<Utc>) {
        self.status = QueryStatus::Success;
        self.data = Some(data);
        self.error = None;
        self.updated_at = Some(updated_at);
        self.is_fetching = false;
        self.revision += 1;
    }

    pub(crate) fn fail(&mut self, error: Error) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
        self.is_fetching = false;
        self.revision += 1;
    }

    /// Data is being fetched for the first time.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Data was fetched (or served from cache) successfully.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// The query is disabled and has not fetched anything.
    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_keeps_previous_data() {
        let mut state = QueryState::cached(1, Utc::now(), false);
        state.start_fetching();
        state.fail(Error::Configuration("boom".into()));

        assert!(state.is_error());
        assert_eq!(state.data, Some(1));
        assert!(!state.is_fetching);
        assert_eq!(state.revision, 1);
    }

    #[test]
    fn idle_becomes_loading_when_fetched() {
        let mut state = QueryState::<u32>::idle();
        assert!(state.is_idle());

        state.start_fetching();
        assert!(state.is_loading());

        state.succeed(7, Utc::now());
        assert!(state.is_success());
        assert!(state.error.is_none());
    }
}
