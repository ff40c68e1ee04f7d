//! Plugins observe (and in the case of [`Plugin::after_get_features`], modify) the evaluation
//! lifecycle.
//!
//! A [`Plugin`] implements any subset of the hooks; every hook has a no-op default. Plugins are
//! kept in an ordered list by the [`Client`](crate::Client), and [`PluginChain`] dispatches each
//! phase across that list.
//!
//! # Dispatch order
//!
//! Observer phases (everything except `after_get_features`) are started for all plugins at once
//! and the pipeline waits until every plugin's hook has settled. No plugin can rely on another
//! plugin's hook for the same phase having completed.
//!
//! `after_get_features` may mutate the results, so it runs sequentially in list order: when two
//! plugins set the same feature, the plugin registered later wins.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use feature_client::{FeatureContext, FeatureValues, Plugin, Result};
//!
//! struct ForceDarkMode;
//!
//! #[async_trait]
//! impl Plugin for ForceDarkMode {
//!     fn name(&self) -> &str {
//!         "force-dark-mode"
//!     }
//!
//!     async fn after_get_features(
//!         &self,
//!         results: &mut FeatureValues,
//!         _context: &FeatureContext,
//!     ) -> Result<()> {
//!         if let Some(value) = results.get_mut("dark-mode") {
//!             *value = true.into();
//!         }
//!         Ok(())
//!     }
//! }
//! ```
use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use reqwest::header::HeaderMap;
use serde::Serialize;
use url::Url;

use crate::{
    context::ContextUpdateSource, fetcher::FeaturesRequest, value::Features, Error,
    FeatureContext, FeatureValue, FeatureValues, Result,
};

/// Read-only view of the client handed to [`Plugin::initialize`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    /// Environment identifier sent with every request.
    pub environment: String,
    /// Base URL of the evaluation service.
    pub base_url: String,
    /// Features (with their fallbacks) the client was configured with.
    pub features: Features,
    /// Default context at the time of initialization.
    pub context: Option<FeatureContext>,
}

/// Outgoing HTTP request passed to [`Plugin::before_request`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Endpoint URL.
    pub url: Url,
    /// Request headers, including `Authorization`.
    pub headers: HeaderMap,
    /// JSON request body.
    pub body: FeaturesRequest,
}

/// Summary of an HTTP response passed to [`Plugin::after_response`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Numeric HTTP status code.
    pub status: u16,
    /// Canonical reason phrase for the status.
    pub status_text: String,
    /// When the response headers were received.
    pub received_at: DateTime<Utc>,
}

impl HttpResponse {
    /// Returns `true` for 2xx responses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request timing passed to [`Plugin::after_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTiming {
    /// Time between sending the request and receiving the response headers.
    pub duration: Duration,
}

/// Why a fallback value was returned for a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackReason {
    /// The whole request failed.
    Error,
    /// The server returned no (or a null) variation for the feature.
    MissingVariation,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Error => f.write_str("error"),
            FallbackReason::MissingVariation => f.write_str("missingVariation"),
        }
    }
}

/// An observer of the evaluation lifecycle.
///
/// All hooks are optional. A hook returning an error fails the phase it belongs to; see
/// [`Client::get_features`](crate::Client::get_features) for how failures are handled.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Called once by [`Client::initialize`](crate::Client::initialize).
    async fn initialize(&self, _client: &ClientSnapshot) -> Result<()> {
        Ok(())
    }

    /// Called by [`Client::cleanup`](crate::Client::cleanup). Flush buffered state here.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Called before features are resolved, with the merged context.
    async fn before_get_features(
        &self,
        _feature_names: &[String],
        _context: &FeatureContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Called with the resolved values before they are returned. May modify `results`.
    async fn after_get_features(
        &self,
        _results: &mut FeatureValues,
        _context: &FeatureContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when resolving features failed.
    async fn on_error(&self, _error: &Error, _context: &FeatureContext) -> Result<()> {
        Ok(())
    }

    /// Called right before each HTTP request (once per attempt).
    async fn before_request(&self, _request: &HttpRequest) -> Result<()> {
        Ok(())
    }

    /// Called once response headers are received, regardless of status.
    async fn after_response(&self, _response: &HttpResponse, _timing: ResponseTiming) -> Result<()> {
        Ok(())
    }

    /// Called when the effective context changes.
    async fn on_context_update(
        &self,
        _old_context: Option<&FeatureContext>,
        _new_context: &FeatureContext,
        _source: ContextUpdateSource,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after each failed network attempt.
    async fn on_retry_attempt(&self, _attempt: u32, _error: &Error, _will_retry: bool) -> Result<()> {
        Ok(())
    }

    /// Called for every feature that resolves to its fallback value.
    async fn on_fallback_used(
        &self,
        _feature_name: &str,
        _fallback_value: &FeatureValue,
        _reason: FallbackReason,
    ) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of plugins with per-phase dispatch.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

impl PluginChain {
    /// Create a chain from plugins in invocation order.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> PluginChain {
        PluginChain { plugins }
    }

    /// Number of plugins in the chain.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns `true` if no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Start `hook` on every plugin, wait for all of them, and report the first failure in list
    /// order.
    async fn fan_out<'a, F>(&'a self, phase: &'static str, hook: F) -> Result<()>
    where
        F: Fn(&'a dyn Plugin) -> BoxFuture<'a, Result<()>>,
    {
        let results = join_all(self.plugins.iter().map(|plugin| hook(plugin.as_ref()))).await;

        let mut first_error = None;
        for (plugin, result) in self.plugins.iter().zip(results) {
            if let Err(err) = result {
                log::warn!(target: "feature_client",
                           plugin = plugin.name(),
                           phase;
                           "plugin hook failed: {}", err);
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) async fn initialize(&self, client: &ClientSnapshot) -> Result<()> {
        self.fan_out("initialize", |p| p.initialize(client)).await
    }

    pub(crate) async fn cleanup(&self) -> Result<()> {
        self.fan_out("cleanup", |p| p.cleanup()).await
    }

    pub(crate) async fn before_get_features(
        &self,
        feature_names: &[String],
        context: &FeatureContext,
    ) -> Result<()> {
        self.fan_out("beforeGetFeatures", |p| {
            p.before_get_features(feature_names, context)
        })
        .await
    }

    /// Runs sequentially in list order, each plugin seeing the previous plugins' changes.
    pub(crate) async fn after_get_features(
        &self,
        results: &mut FeatureValues,
        context: &FeatureContext,
    ) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .after_get_features(results, context)
                .await
                .inspect_err(|err| {
                    log::warn!(target: "feature_client",
                               plugin = plugin.name(),
                               phase = "afterGetFeatures";
                               "plugin hook failed: {}", err);
                })?;
        }
        Ok(())
    }

    pub(crate) async fn on_error(&self, error: &Error, context: &FeatureContext) -> Result<()> {
        self.fan_out("onError", |p| p.on_error(error, context)).await
    }

    pub(crate) async fn before_request(&self, request: &HttpRequest) -> Result<()> {
        self.fan_out("beforeRequest", |p| p.before_request(request))
            .await
    }

    pub(crate) async fn after_response(
        &self,
        response: &HttpResponse,
        timing: ResponseTiming,
    ) -> Result<()> {
        self.fan_out("afterResponse", |p| p.after_response(response, timing))
            .await
    }

    pub(crate) async fn on_context_update(
        &self,
        old_context: Option<&FeatureContext>,
        new_context: &FeatureContext,
        source: ContextUpdateSource,
    ) -> Result<()> {
        self.fan_out("onContextUpdate", |p| {
            p.on_context_update(old_context, new_context, source)
        })
        .await
    }

    pub(crate) async fn on_retry_attempt(
        &self,
        attempt: u32,
        error: &Error,
        will_retry: bool,
    ) -> Result<()> {
        self.fan_out("onRetryAttempt", |p| {
            p.on_retry_attempt(attempt, error, will_retry)
        })
        .await
    }

    pub(crate) async fn on_fallback_used(
        &self,
        feature_name: &str,
        fallback_value: &FeatureValue,
        reason: FallbackReason,
    ) -> Result<()> {
        self.fan_out("onFallbackUsed", |p| {
            p.on_fallback_used(feature_name, fallback_value, reason)
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every hook invocation as `"<plugin>:<hook>"`.
    pub(crate) struct RecordingPlugin {
        pub name: String,
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_on: Option<&'static str>,
    }

    impl RecordingPlugin {
        pub fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> RecordingPlugin {
            RecordingPlugin {
                name: name.to_owned(),
                log,
                fail_on: None,
            }
        }

        fn record(&self, hook: &'static str) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, hook));
            if self.fail_on == Some(hook) {
                return Err(Error::plugin(&self.name, format!("{hook} failed")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        async fn cleanup(&self) -> Result<()> {
            self.record("cleanup")
        }

        async fn before_get_features(&self, _: &[String], _: &FeatureContext) -> Result<()> {
            self.record("beforeGetFeatures")
        }

        async fn after_get_features(
            &self,
            results: &mut FeatureValues,
            _: &FeatureContext,
        ) -> Result<()> {
            results.insert("last-writer".to_owned(), self.name.as_str().into());
            self.record("afterGetFeatures")
        }

        async fn on_error(&self, _: &Error, _: &FeatureContext) -> Result<()> {
            self.record("onError")
        }

        async fn before_request(&self, _: &HttpRequest) -> Result<()> {
            self.record("beforeRequest")
        }

        async fn after_response(&self, _: &HttpResponse, _: ResponseTiming) -> Result<()> {
            self.record("afterResponse")
        }

        async fn on_context_update(
            &self,
            _: Option<&FeatureContext>,
            _: &FeatureContext,
            _: ContextUpdateSource,
        ) -> Result<()> {
            self.record("onContextUpdate")
        }

        async fn on_retry_attempt(&self, _: u32, _: &Error, _: bool) -> Result<()> {
            self.record("onRetryAttempt")
        }

        async fn on_fallback_used(
            &self,
            _: &str,
            _: &FeatureValue,
            _: FallbackReason,
        ) -> Result<()> {
            self.record("onFallbackUsed")
        }
    }

    struct Silent;

    #[async_trait]
    impl Plugin for Silent {
        fn name(&self) -> &str {
            "silent"
        }
    }

    #[tokio::test]
    async fn missing_hooks_are_tolerated() {
        let chain = PluginChain::new(vec![Arc::new(Silent)]);
        let mut results = FeatureValues::new();

        chain
            .before_get_features(&["a".to_owned()], &FeatureContext::new())
            .await
            .unwrap();
        chain
            .after_get_features(&mut results, &FeatureContext::new())
            .await
            .unwrap();
        chain.cleanup().await.unwrap();

        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn every_plugin_is_invoked_in_list_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(vec![
            Arc::new(RecordingPlugin::new("p1", log.clone())),
            Arc::new(RecordingPlugin::new("p2", log.clone())),
        ]);

        chain
            .before_get_features(&[], &FeatureContext::new())
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["p1:beforeGetFeatures", "p2:beforeGetFeatures"]
        );
    }

    #[tokio::test]
    async fn later_plugin_wins_on_mutation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = PluginChain::new(vec![
            Arc::new(RecordingPlugin::new("p1", log.clone())),
            Arc::new(RecordingPlugin::new("p2", log.clone())),
        ]);
        let mut results = FeatureValues::new();

        chain
            .after_get_features(&mut results, &FeatureContext::new())
            .await
            .unwrap();

        assert_eq!(results["last-writer"], FeatureValue::from("p2"));
    }

    #[tokio::test]
    async fn failing_hook_does_not_skip_other_plugins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = RecordingPlugin::new("p1", log.clone());
        failing.fail_on = Some("onError");
        let chain = PluginChain::new(vec![
            Arc::new(failing),
            Arc::new(RecordingPlugin::new("p2", log.clone())),
        ]);

        let result = chain
            .on_error(&Error::Configuration("x".into()), &FeatureContext::new())
            .await;

        assert!(matches!(result, Err(Error::Plugin { ref plugin, .. }) if plugin == "p1"));
        assert_eq!(*log.lock().unwrap(), vec!["p1:onError", "p2:onError"]);
    }

    #[tokio::test]
    async fn failing_mutation_stops_the_phase() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = RecordingPlugin::new("p1", log.clone());
        failing.fail_on = Some("afterGetFeatures");
        let chain = PluginChain::new(vec![
            Arc::new(failing),
            Arc::new(RecordingPlugin::new("p2", log.clone())),
        ]);

        let result = chain
            .after_get_features(&mut FeatureValues::new(), &FeatureContext::new())
            .await;

        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["p1:afterGetFeatures"]);
    }
}
