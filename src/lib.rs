//! A client for resolving feature flags against a remote evaluation service.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that resolves named features to [`FeatureValue`]s. Every
//! request carries an evaluation context ([`FeatureContext`]) describing the subject, merged from
//! the client default context and the context passed to the call.
//!
//! Callers supply a fallback value per feature. Fallbacks are returned whenever remote evaluation
//! is unavailable, so feature resolution never has to fail for availability reasons.
//!
//! Results are kept in a [`QueryCache`](query::QueryCache) with stale-while-revalidate semantics,
//! and concurrent requests for the same features share one network call. Reactive consumers
//! (UI bindings) observe results through [`Client::watch_features`].
//!
//! [`Plugin`]s observe the evaluation lifecycle and may modify results, e.g. to apply local
//! overrides. A few are bundled in [`plugins`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Network and server failures are retried with exponential backoff (see [`RetryConfig`]) and
//! then replaced with fallback values. Errors that indicate a bug in the calling code (such as
//! [`Error::TypeMismatch`]) are always returned.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages. Consider integrating a `log`-compatible logger implementation for better visibility
//! into client operations.
//!
//! # Examples
//!
//! ```no_run
//! use feature_client::{ClientConfig, FeatureOptions};
//!
//! # async fn run() -> feature_client::Result<()> {
//! let client = ClientConfig::new("api-key", "production").to_client()?;
//! client.initialize().await?;
//!
//! let dark_mode = client
//!     .get_feature("dark-mode", FeatureOptions::new().with_fallback(false))
//!     .await?;
//!
//! client.cleanup().await?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
mod context;
mod error;
mod fetcher;
mod plugin;
mod value;

pub mod plugins;
pub mod query;
pub mod retry;

pub use client::{Client, FeatureOptions};
pub use config::{CacheConfig, ClientConfig, RetryConfig};
pub use context::{merge_context, ContextUpdateSource, ContextValue, FeatureContext};
pub use error::{Error, Result};
pub use fetcher::{FeatureEvaluation, FeaturesRequest, FeaturesResponse};
pub use plugin::{
    ClientSnapshot, FallbackReason, HttpRequest, HttpResponse, Plugin, PluginChain,
    ResponseTiming,
};
pub use value::{FeatureValue, FeatureValueKind, FeatureValues, Features};
