use async_trait::async_trait;

use crate::{
    ClientSnapshot, ContextUpdateSource, Error, FallbackReason, FeatureContext, FeatureValue,
    FeatureValues, HttpRequest, HttpResponse, Plugin, ResponseTiming, Result,
};

/// Writes every lifecycle event to the [`log`](https://docs.rs/log) facade.
///
/// Successful phases are logged at debug level, failures, retries and fallbacks at warn level.
/// Request headers are never logged.
#[derive(Debug, Clone, Default)]
pub struct LoggingPlugin {
    _private: (),
}

impl LoggingPlugin {
    /// Create a new logging plugin.
    pub fn new() -> LoggingPlugin {
        LoggingPlugin::default()
    }
}

#[async_trait]
impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    async fn initialize(&self, client: &ClientSnapshot) -> Result<()> {
        log::debug!(target: "feature_client",
                    environment = client.environment.as_str(),
                    base_url = client.base_url.as_str(),
                    features = client.features.len();
                    "client initialized");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        log::debug!(target: "feature_client", "client cleaned up");
        Ok(())
    }

    async fn before_get_features(
        &self,
        feature_names: &[String],
        context: &FeatureContext,
    ) -> Result<()> {
        log::debug!(target: "feature_client",
                    features:serde = feature_names,
                    context:serde = context;
                    "resolving features");
        Ok(())
    }

    async fn after_get_features(
        &self,
        results: &mut FeatureValues,
        _context: &FeatureContext,
    ) -> Result<()> {
        log::debug!(target: "feature_client",
                    results:serde = &*results;
                    "resolved features");
        Ok(())
    }

    async fn on_error(&self, error: &Error, _context: &FeatureContext) -> Result<()> {
        log::warn!(target: "feature_client", "failed to resolve features: {}", error);
        Ok(())
    }

    async fn before_request(&self, request: &HttpRequest) -> Result<()> {
        log::debug!(target: "feature_client",
                    url:display = request.url,
                    features:serde = request.body.features;
                    "sending request");
        Ok(())
    }

    async fn after_response(&self, response: &HttpResponse, timing: ResponseTiming) -> Result<()> {
        log::debug!(target: "feature_client",
                    status = response.status,
                    duration_ms = timing.duration.as_millis() as u64;
                    "received response");
        Ok(())
    }

    async fn on_context_update(
        &self,
        _old_context: Option<&FeatureContext>,
        new_context: &FeatureContext,
        source: ContextUpdateSource,
    ) -> Result<()> {
        log::debug!(target: "feature_client",
                    source:display = source,
                    context:serde = new_context;
                    "context updated");
        Ok(())
    }

    async fn on_retry_attempt(&self, attempt: u32, error: &Error, will_retry: bool) -> Result<()> {
        log::warn!(target: "feature_client",
                   attempt,
                   will_retry;
                   "request attempt failed: {}", error);
        Ok(())
    }

    async fn on_fallback_used(
        &self,
        feature_name: &str,
        fallback_value: &FeatureValue,
        reason: FallbackReason,
    ) -> Result<()> {
        log::warn!(target: "feature_client",
                   feature = feature_name,
                   fallback:serde = fallback_value,
                   reason:display = reason;
                   "using fallback value");
        Ok(())
    }
}
