//! A small asynchronous query cache with stale-while-revalidate semantics.
//!
//! [`QueryCache`] stores values produced by async functions under string keys. Consumers either
//! resolve a key once with [`QueryCache::fetch`] or keep a reactive [`Query`] handle obtained
//! from [`QueryCache::subscribe`], which follows the key through refetches and invalidations.
//!
//! [`Client`](crate::Client) owns a `QueryCache<FeatureValues>` keyed by [`QueryKey`]. Framework
//! adapters share it through [`Client::query_cache`](crate::Client::query_cache).
mod cache;
mod key;
mod observer;
mod options;
mod state;

pub use cache::{QueryCache, QueryFn};
pub use key::QueryKey;
pub use observer::Query;
pub use options::{QueryOptions, QueryRetry};
pub use state::{QueryState, QueryStatus};
